use async_trait::async_trait;
use certkeeper_common::views::HttpAction;
use reqwest::{Method, header::CONTENT_TYPE};

use super::{DeployContext, DeployTarget, Deployer, summarize};
use crate::error::{EngineError, EngineResult};

/// An [`HttpAction`] configured as a webhook: without a body template it
/// posts a JSON event describing the deployment.
pub struct Webhook<'a>(pub &'a HttpAction);

async fn send(
    kind: &str,
    action: &HttpAction,
    ctx: &DeployContext,
    deployer: &Deployer,
    default_body: Option<serde_json::Value>,
) -> EngineResult<String> {
    let method = Method::from_bytes(action.method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| EngineError::invalid(format!("{:?} is not an HTTP method", action.method)))?;
    let url = ctx.expand(&action.url);

    let mut request = deployer.http.request(method.clone(), &url);
    for (name, value) in &action.headers {
        request = request.header(name.as_str(), ctx.expand(value));
    }

    let has_content_type = action
        .headers
        .keys()
        .any(|k| k.eq_ignore_ascii_case(CONTENT_TYPE.as_str()));

    match (&action.body, default_body) {
        (Some(template), _) => {
            let body = ctx.expand(template);
            if !has_content_type && serde_json::from_str::<serde_json::Value>(&body).is_ok() {
                request = request.header(CONTENT_TYPE, "application/json");
            }
            request = request.body(body);
        }
        (None, Some(event)) => request = request.json(&event),
        (None, None) => {}
    }

    let response = request
        .send()
        .await
        .map_err(|e| EngineError::deploy(kind, format!("{method} {url}: {e}")))?;
    let status = response.status();

    if status.is_success() {
        Ok(format!("{method} {url} returned {status}"))
    } else {
        let body = response.bytes().await.unwrap_or_default();
        Err(EngineError::deploy(
            kind,
            format!("{method} {url} returned {status}: {}", summarize(&body)),
        ))
    }
}

#[async_trait]
impl DeployTarget for HttpAction {
    async fn deploy(&self, ctx: &DeployContext, deployer: &Deployer) -> EngineResult<String> {
        send("api-call", self, ctx, deployer, None).await
    }
}

#[async_trait]
impl<'a> DeployTarget for Webhook<'a> {
    async fn deploy(&self, ctx: &DeployContext, deployer: &Deployer) -> EngineResult<String> {
        send(
            "webhook",
            self.0,
            ctx,
            deployer,
            Some(ctx.event("certificate.deployed")),
        )
        .await
    }
}
