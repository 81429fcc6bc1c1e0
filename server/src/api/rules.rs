use crate::util::{form_body, result_response};
use crate::{ops, Context, ServerError};
use hyper::{Body, Method, Request, Response};
use serde::Deserialize;
use std::collections::VecDeque;

#[derive(Debug, Deserialize)]
struct ForwardSpec {
    command: String,
    source: String,
    #[serde(default)]
    destination: String,
    protocol: String,
    position: u32,
    #[serde(default)]
    port: String,
    comment: String,
    #[serde(default, rename = "list")]
    is_list: bool,
    action: String,
    #[serde(default)]
    except: bool,
}

#[derive(Debug, Deserialize)]
struct UpdateListSpec {
    command: String,
    ipset_name: String,
    #[serde(default)]
    ip_list: Vec<String>,
    #[serde(default)]
    single: bool,
}

#[derive(Debug, Deserialize)]
struct MasqueradeSpec {
    command: String,
    source: String,
    ifname: String,
    comment: String,
}

pub async fn routes(
    req: Request<Body>,
    mut components: VecDeque<String>,
    context: Context,
) -> Result<Response<Body>, ServerError> {
    let method = req.method().clone();
    match (method, components.pop_front().as_deref()) {
        (Method::POST, Some("forward")) => match components.pop_front().as_deref() {
            None => handlers::set_forward(form_body(req).await?, context).await,
            Some("updateList") => handlers::update_list(form_body(req).await?, context).await,
            _ => Err(ServerError::NotFound),
        },
        (Method::POST, Some("masquerade")) => {
            handlers::set_masquerade(form_body(req).await?, context).await
        }
        (Method::GET, Some("rules")) => handlers::rules(context).await,
        _ => Err(ServerError::NotFound),
    }
}

mod handlers {
    use super::*;

    pub async fn set_forward(
        form: ForwardSpec,
        context: Context,
    ) -> Result<Response<Body>, ServerError> {
        if form.position < 1 {
            return Err(ServerError::invalid("position must be at least 1"));
        }
        if form.position > 65535 {
            return Err(ServerError::invalid("position must be at most 65535"));
        }
        if !matches!(form.action.to_uppercase().as_str(), "ACCEPT" | "DROP") {
            return Err(ServerError::invalid("action can be: ACCEPT, DROP"));
        }
        if form.comment.is_empty() {
            return Err(ServerError::invalid("comment is required"));
        }
        let comment = form.comment.replace(' ', "_");

        ops::rules::set_forward(
            &context,
            form.position,
            &form.action,
            &form.command,
            &form.source,
            &form.destination,
            &form.protocol,
            &form.port,
            &comment,
            form.is_list,
            form.except,
        )?;
        result_response("ok")
    }

    pub async fn update_list(
        form: UpdateListSpec,
        context: Context,
    ) -> Result<Response<Body>, ServerError> {
        ops::rules::update_ipset_list(
            &context,
            &form.command,
            &form.ipset_name,
            &form.ip_list,
            form.single,
        )?;
        result_response("ok")
    }

    pub async fn set_masquerade(
        form: MasqueradeSpec,
        context: Context,
    ) -> Result<Response<Body>, ServerError> {
        let comment = form.comment.replace(' ', "_");
        ops::rules::set_masquerade(&context, &form.command, &form.source, &form.ifname, &comment)?;
        result_response("ok")
    }

    pub async fn rules(context: Context) -> Result<Response<Body>, ServerError> {
        result_response(ops::rules::iptables_rules(&context)?)
    }
}
