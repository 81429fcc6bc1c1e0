use crate::util::{form_body, result_response};
use crate::{ops, Context, ServerError};
use hyper::{Body, Method, Request, Response};
use serde::Deserialize;
use std::collections::VecDeque;

#[derive(Debug, Deserialize)]
struct AddServer {
    ifname: String,
    ip: String,
    endpoint: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct DeleteServer {
    private: String,
    ifname: String,
}

#[derive(Debug, Deserialize)]
struct StartStop {
    ifname: String,
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
            if !context.delete_interface {
                return Err(ServerError::invalid(
                    "Don't have permissions for delete interface on this server",
                ));
            }
            handlers::delete(form_body(req).await?, context).await
        }
        (Method::POST, Some("stop")) => handlers::stop(form_body(req).await?, context).await,
        (Method::POST, Some("start")) => handlers::start(form_body(req).await?, context).await,
        (Method::GET, Some("all")) => handlers::list(context).await,
        (Method::GET, Some("archive")) => handlers::archive(context).await,
        _ => Err(ServerError::NotFound),
    }
}

mod handlers {
    use super::*;

    pub async fn create(form: AddServer, context: Context) -> Result<Response<Body>, ServerError> {
        let data =
            ops::interface::new_interface(&context, &form.ifname, &form.ip, &form.endpoint, form.port)?;
        result_response(data)
    }

    pub async fn delete(
        form: DeleteServer,
        context: Context,
    ) -> Result<Response<Body>, ServerError> {
        ops::interface::delete_server(&context, &form.private, &form.ifname)?;
        result_response("ok")
    }

    pub async fn stop(form: StartStop, context: Context) -> Result<Response<Body>, ServerError> {
        ops::interface::stop_interface(&context, &form.ifname)?;
        result_response("ok")
    }

    pub async fn start(form: StartStop, context: Context) -> Result<Response<Body>, ServerError> {
        ops::interface::start_interface(&context, &form.ifname)?;
        result_response("ok")
    }

    pub async fn list(context: Context) -> Result<Response<Body>, ServerError> {
        result_response(ops::interface::server_interfaces(&context)?)
    }

    pub async fn archive(context: Context) -> Result<Response<Body>, ServerError> {
        result_response(ops::interface::server_archive(&context)?)
    }
}

#[cfg(test)]
mod tests {
    use crate::test;
    use anyhow::Result;
    use hyper::StatusCode;

    #[tokio::test]
    async fn test_provision_and_teardown() -> Result<()> {
        let server = test::Server::new()?;

        let res = server
            .post(
                "/interface/new",
                r#"{"ifname":"wg0","ip":"10.0.0.1/24","endpoint":"203.0.113.5","port":51820}"#,
            )
            .await;
        assert_eq!(res.0, StatusCode::OK);
        let created = &res.1["result"];
        assert_eq!(created["ifname"], "wg0");
        let private = created["private"].as_str().unwrap().to_string();
        assert!(created["config"]
            .as_str()
            .unwrap()
            .contains("ListenPort = 51820"));

        // The fake kernel saw the whole start sequence.
        assert!(server
            .kernel
            .saw("ip link add dev wg0 type wireguard"));
        assert!(server.kernel.saw("ip addr add 10.0.0.1/24 dev wg0"));
        assert!(server.kernel.saw("ip link set wg0 up"));

        // Three clients allocate consecutive addresses after the server's.
        for expected in ["10.0.0.2/24", "10.0.0.3/24", "10.0.0.4/24"] {
            let res = server
                .post("/clients/new", r#"{"ifname":"wg0","ip":"","alloweip":""}"#)
                .await;
            assert_eq!(res.0, StatusCode::OK);
            assert_eq!(res.1["result"]["ip"], expected);
        }

        let res = server
            .request(
                hyper::Method::DELETE,
                "/interface",
                Some(format!(
                    r#"{{"private":"{private}","ifname":"wg0"}}"#
                )),
            )
            .await;
        assert_eq!(res.0, StatusCode::OK);
        assert_eq!(res.1["result"], "ok");
        assert!(server.kernel.saw("ip link del dev wg0 type wireguard"));

        // Archives now hold one server and three clients.
        let res = server.get("/interface/archive").await;
        assert_eq!(res.1["result"].as_array().unwrap().len(), 1);
        assert!(res.1["result"][0]["deleted_at"].as_i64().unwrap() > 0);
        let res = server.get("/clients/archive").await;
        assert_eq!(res.1["result"].as_array().unwrap().len(), 3);

        // And the live listing is empty again.
        let res = server.get("/interface/all").await;
        assert_eq!(res.1["result"].as_array().unwrap().len(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_create_rejects_existing_interface() -> Result<()> {
        let server = test::Server::new()?;

        let res = server
            .post(
                "/interface/new",
                r#"{"ifname":"eth0","ip":"10.0.0.1/24","endpoint":"203.0.113.5","port":51820}"#,
            )
            .await;
        assert_eq!(res.0, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.1["result"], "interface eth0 already exist");
        Ok(())
    }

    #[tokio::test]
    async fn test_create_rejects_bad_cidr() -> Result<()> {
        let server = test::Server::new()?;

        let res = server
            .post(
                "/interface/new",
                r#"{"ifname":"wg0","ip":"10.0.0.1","endpoint":"203.0.113.5","port":51820}"#,
            )
            .await;
        assert_eq!(res.0, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(res.1["result"]
            .as_str()
            .unwrap()
            .contains("invalid CIDR format"));
        Ok(())
    }

    #[tokio::test]
    async fn test_ifname_is_lowercased_and_trimmed() -> Result<()> {
        let server = test::Server::new()?;

        let res = server
            .post(
                "/interface/new",
                r#"{"ifname":"  WG0 ","ip":"10.0.0.1/24","endpoint":"203.0.113.5","port":51820}"#,
            )
            .await;
        assert_eq!(res.0, StatusCode::OK);
        assert_eq!(res.1["result"]["ifname"], "wg0");
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_gate() -> Result<()> {
        let mut server = test::Server::new()?;
        server.delete_interface = false;

        server
            .post(
                "/interface/new",
                r#"{"ifname":"wg0","ip":"10.0.0.1/24","endpoint":"203.0.113.5","port":51820}"#,
            )
            .await;

        let res = server
            .request(
                hyper::Method::DELETE,
                "/interface",
                Some(r#"{"private":"x","ifname":"wg0"}"#.to_string()),
            )
            .await;
        assert_eq!(res.0, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(res.1["result"]
            .as_str()
            .unwrap()
            .starts_with("Don't have permissions"));

        // Nothing moved to the archive.
        let res = server.get("/interface/archive").await;
        assert_eq!(res.1["result"].as_array().unwrap().len(), 0);
        let res = server.get("/interface/all").await;
        assert_eq!(res.1["result"].as_array().unwrap().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_and_start_round_trip() -> Result<()> {
        let server = test::Server::new()?;
        server
            .post(
                "/interface/new",
                r#"{"ifname":"wg0","ip":"10.0.0.1/24","endpoint":"203.0.113.5","port":51820}"#,
            )
            .await;

        let res = server.post("/interface/stop", r#"{"ifname":"wg0"}"#).await;
        assert_eq!(res.0, StatusCode::OK);
        assert!(server.kernel.saw("ip link del dev wg0 type wireguard"));

        let res = server.post("/interface/start", r#"{"ifname":"wg0"}"#).await;
        assert_eq!(res.0, StatusCode::OK);

        // The start sequence ran twice in total (create + restart).
        let adds = server
            .kernel
            .calls_matching("ip link add dev wg0 type wireguard");
        assert_eq!(adds, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() -> Result<()> {
        let server = test::Server::new()?;
        let res = server.get("/interface/bogus").await;
        assert_eq!(res.0, StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn test_version_endpoint() -> Result<()> {
        let server = test::Server::new()?;
        let res = server.get("/version").await;
        assert_eq!(res.0, StatusCode::OK);
        assert_eq!(res.1["result"], crate::VERSION);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_omits_config() -> Result<()> {
        let server = test::Server::new()?;
        server
            .post(
                "/interface/new",
                r#"{"ifname":"wg0","ip":"10.0.0.1/24","endpoint":"203.0.113.5","port":51820}"#,
            )
            .await;

        let res = server.get("/interface/all").await;
        let entry = &res.1["result"][0];
        assert_eq!(entry["ifname"], "wg0");
        assert_eq!(entry["port"], 51820);
        assert_eq!(entry["config"], "");
        Ok(())
    }
}
