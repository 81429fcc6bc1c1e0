use hyper::{body::Buf, header, Body, Request, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};

use crate::ServerError;

pub async fn form_body<F: DeserializeOwned>(req: Request<Body>) -> Result<F, ServerError> {
    let content_len: usize = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.parse().ok())
        .ok_or_else(|| ServerError::invalid("missing or invalid Content-Length"))?;

    if content_len > 16 * 1024 {
        return Err(ServerError::invalid("request body too large"));
    }

    let whole_body = hyper::body::aggregate(req).await?;

    serde_json::from_reader(whole_body.reader()).map_err(Into::into)
}

/// Every successful reply is wrapped in the `{"result": ...}` envelope.
pub fn result_response<F: Serialize>(payload: F) -> Result<Response<Body>, ServerError> {
    let json = serde_json::to_string(&serde_json::json!({ "result": payload }))?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json))?)
}
