use crate::util::{form_body, result_response};
use crate::{ops, Context, ServerError};
use hyper::{Body, Method, Request, Response};
use serde::Deserialize;
use std::collections::VecDeque;

#[derive(Debug, Deserialize)]
struct AddClient {
    ifname: String,
    #[serde(default)]
    ip: String,
    #[serde(default, rename = "alloweip")]
    allowed_ips: String,
}

#[derive(Debug, Deserialize)]
struct DeleteClient {
    public: String,
}

pub async fn routes(
    req: Request<Body>,
    mut components: VecDeque<String>,
    context: Context,
) -> Result<Response<Body>, ServerError> {
    let method = req.method().clone();
    match (method, components.pop_front().as_deref()) {
        (Method::POST, Some("new")) => handlers::create(form_body(req).await?, context).await,
        (Method::DELETE, None) => {
            if !context.delete_client {
                return Err(ServerError::invalid(
                    "Don't have permissions for delete client on this server",
                ));
            }
            handlers::delete(form_body(req).await?, context).await
        }
        (Method::GET, Some("getall")) => handlers::list(context).await,
        (Method::GET, Some("status")) => handlers::status(context).await,
        (Method::GET, Some("archive")) => handlers::archive(context).await,
        _ => Err(ServerError::NotFound),
    }
}

mod handlers {
    use super::*;

    pub async fn create(form: AddClient, context: Context) -> Result<Response<Body>, ServerError> {
        let data = ops::client::new_client(&context, &form.ifname, &form.ip, &form.allowed_ips)?;
        result_response(data)
    }

    pub async fn delete(
        form: DeleteClient,
        context: Context,
    ) -> Result<Response<Body>, ServerError> {
        ops::client::delete_client(&context, &form.public)?;
        result_response("ok")
    }

    pub async fn list(context: Context) -> Result<Response<Body>, ServerError> {
        result_response(ops::client::all_clients(&context)?)
    }

    pub async fn status(context: Context) -> Result<Response<Body>, ServerError> {
        result_response(ops::client::status(&context)?)
    }

    pub async fn archive(context: Context) -> Result<Response<Body>, ServerError> {
        result_response(ops::client::client_archive(&context)?)
    }
}

#[cfg(test)]
mod tests {
    use crate::probe;
    use crate::test::{self, PingBehavior, ScriptedSocketFactory};
    use anyhow::Result;
    use hyper::StatusCode;
    use std::net::IpAddr;

    async fn server_with_interface() -> Result<test::Server> {
        let server = test::Server::new()?;
        let res = server
            .post(
                "/interface/new",
                r#"{"ifname":"wg0","ip":"10.0.0.1/24","endpoint":"203.0.113.5","port":51820}"#,
            )
            .await;
        assert_eq!(res.0, StatusCode::OK);
        Ok(server)
    }

    #[tokio::test]
    async fn test_create_with_explicit_ip() -> Result<()> {
        let server = server_with_interface().await?;

        let res = server
            .post(
                "/clients/new",
                r#"{"ifname":"wg0","ip":"10.0.0.7/24","alloweip":"192.168.0.0/16"}"#,
            )
            .await;
        assert_eq!(res.0, StatusCode::OK);
        let created = &res.1["result"];
        assert_eq!(created["ip"], "10.0.0.7/24");
        assert_eq!(created["alloweip"], "192.168.0.0/16");
        let config = created["config"].as_str().unwrap();
        assert!(config.contains("Address = 10.0.0.7/24"));
        assert!(config.contains("Endpoint = 203.0.113.5:51820"));
        assert!(config.contains("PersistentKeepalive = 20"));
        assert!(config.contains("10.0.0.0/24"));
        Ok(())
    }

    #[tokio::test]
    async fn test_create_normalizes_allowed_ips() -> Result<()> {
        let server = server_with_interface().await?;

        let res = server
            .post(
                "/clients/new",
                r#"{"ifname":"wg0","ip":"","alloweip":"10.10.0.0/16 , 192.168.0.0/16,,  172.16.0.0/12"}"#,
            )
            .await;
        assert_eq!(res.0, StatusCode::OK);
        assert_eq!(
            res.1["result"]["alloweip"],
            "10.10.0.0/16,192.168.0.0/16,172.16.0.0/12"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_create_rejects_wrong_subnet() -> Result<()> {
        let server = server_with_interface().await?;

        let res = server
            .post(
                "/clients/new",
                r#"{"ifname":"wg0","ip":"10.9.0.5/24","alloweip":""}"#,
            )
            .await;
        assert_eq!(res.0, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(res.1["result"]
            .as_str()
            .unwrap()
            .contains("incorrect subnet"));
        Ok(())
    }

    #[tokio::test]
    async fn test_create_rejects_server_address() -> Result<()> {
        let server = server_with_interface().await?;

        let res = server
            .post(
                "/clients/new",
                r#"{"ifname":"wg0","ip":"10.0.0.1/24","alloweip":""}"#,
            )
            .await;
        assert_eq!(res.0, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(res.1["result"]
            .as_str()
            .unwrap()
            .contains("cannot be same as interface"));
        Ok(())
    }

    #[tokio::test]
    async fn test_create_on_unknown_interface() -> Result<()> {
        let server = test::Server::new()?;

        let res = server
            .post("/clients/new", r#"{"ifname":"wg9","ip":"","alloweip":""}"#)
            .await;
        assert_eq!(res.0, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.1["result"], "interface wg9 not found");
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_gate_leaves_store_untouched() -> Result<()> {
        let mut server = server_with_interface().await?;
        server.delete_client = false;

        let res = server
            .post("/clients/new", r#"{"ifname":"wg0","ip":"","alloweip":""}"#)
            .await;
        let public = res.1["result"]["public"].as_str().unwrap().to_string();

        let res = server
            .request(
                hyper::Method::DELETE,
                "/clients",
                Some(format!(r#"{{"public":"{public}"}}"#)),
            )
            .await;
        assert_eq!(res.0, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            res.1["result"],
            "Don't have permissions for delete client on this server"
        );

        let res = server.get("/clients/getall").await;
        assert_eq!(res.1["result"].as_array().unwrap().len(), 1);
        let res = server.get("/clients/archive").await;
        assert_eq!(res.1["result"].as_array().unwrap().len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_removes_liveness_entry() -> Result<()> {
        let server = server_with_interface().await?;

        let res = server
            .post("/clients/new", r#"{"ifname":"wg0","ip":"","alloweip":""}"#)
            .await;
        let public = res.1["result"]["public"].as_str().unwrap().to_string();

        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        server
            .liveness
            .write(ip, true, std::time::Duration::from_millis(3));

        let res = server
            .request(
                hyper::Method::DELETE,
                "/clients",
                Some(format!(r#"{{"public":"{public}"}}"#)),
            )
            .await;
        assert_eq!(res.0, StatusCode::OK);
        assert_eq!(
            server.liveness.read(&ip),
            (false, std::time::Duration::ZERO)
        );

        let res = server.get("/clients/archive").await;
        assert_eq!(res.1["result"].as_array().unwrap().len(), 1);
        assert!(res.1["result"][0]["deleted_at"].as_i64().unwrap() > 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_getall_reports_liveness_after_probe_tick() -> Result<()> {
        let server = server_with_interface().await?;
        for _ in 0..2 {
            server
                .post("/clients/new", r#"{"ifname":"wg0","ip":"","alloweip":""}"#)
                .await;
        }

        // One manual prober pass: .2 answers, .3 times out.
        let factory = ScriptedSocketFactory::new();
        factory.script("10.0.0.2".parse().unwrap(), PingBehavior::Reply);
        factory.script("10.0.0.3".parse().unwrap(), PingBehavior::Timeout);
        probe::probe("10.0.0.2".parse().unwrap(), &factory, &server.liveness);
        probe::probe("10.0.0.3".parse().unwrap(), &factory, &server.liveness);

        let res = server.get("/clients/getall").await;
        let clients = res.1["result"].as_array().unwrap().clone();
        assert_eq!(clients.len(), 2);

        let by_ip = |ip: &str| {
            clients
                .iter()
                .find(|c| c["ip"] == format!("{ip}/24"))
                .unwrap()
                .clone()
        };
        let up = by_ip("10.0.0.2");
        assert_eq!(up["ping_status"]["status"], true);
        assert!(up["ping_status"]["ping_time"].as_i64().unwrap() > 0);

        let down = by_ip("10.0.0.3");
        assert_eq!(down["ping_status"]["status"], false);
        assert_eq!(down["ping_status"]["ping_time"], 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_status_lists_devices() -> Result<()> {
        let server = test::Server::new()?;
        let res = server.get("/clients/status").await;
        assert_eq!(res.0, StatusCode::OK);
        assert!(res.1["result"].as_array().unwrap().is_empty());
        Ok(())
    }
}
