use std::time::Duration;

use serde::Deserialize;

use super::{ActionId, CloudApi, CloudError, CloudResource, ResourceKind};

pub const API_URL: &str = "https://api.hetzner.cloud/v1";
const PER_PAGE: u32 = 50;

/// Hetzner Cloud API v1, authenticated with a project token.
pub struct HetznerCloud {
    client: reqwest::Client,
    base_url: String,
    token: String,
    action_poll_interval: Duration,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(alias = "servers", alias = "load_balancers", alias = "networks")]
    items: Vec<Item>,
    #[serde(default)]
    meta: Meta,
}

#[derive(Deserialize)]
struct Item {
    id: u64,
    name: String,
}

#[derive(Deserialize, Default)]
struct Meta {
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Deserialize, Default)]
struct Pagination {
    next_page: Option<u32>,
}

#[derive(Deserialize)]
struct ActionResponse {
    action: Action,
}

#[derive(Deserialize)]
struct Action {
    id: u64,
    status: String,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    code: String,
    message: String,
}

fn collection(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Server => "servers",
        ResourceKind::LoadBalancer => "load_balancers",
        ResourceKind::Network => "networks",
    }
}

impl HetznerCloud {
    pub fn new(client: reqwest::Client, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: API_URL.to_owned(),
            token: token.into(),
            action_poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_action_poll_interval(mut self, interval: Duration) -> Self {
        self.action_poll_interval = interval;
        self
    }

    async fn send(&self, method: reqwest::Method, endpoint: &str) -> Result<bytes::Bytes, CloudError> {
        let url = format!("{}{endpoint}", self.base_url);
        let transport = |source| CloudError::Transport {
            endpoint: endpoint.to_owned(),
            source,
        };
        let response = self
            .client
            .request(method, url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport)?;
        if status.is_success() {
            return Ok(body);
        }
        let (code, message) = match serde_json::from_slice::<ErrorResponse>(&body) {
            Ok(ErrorResponse { error }) => (error.code, error.message),
            Err(_) => (String::new(), String::from_utf8_lossy(&body).into_owned()),
        };
        Err(CloudError::Api {
            endpoint: endpoint.to_owned(),
            status: status.as_u16(),
            code,
            message,
        })
    }

    fn parse<T: serde::de::DeserializeOwned>(endpoint: &str, body: &[u8]) -> Result<T, CloudError> {
        serde_json::from_slice(body).map_err(|e| CloudError::Api {
            endpoint: endpoint.to_owned(),
            status: 200,
            code: "invalid_response".to_owned(),
            message: e.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl CloudApi for HetznerCloud {
    async fn list(&self, kind: ResourceKind) -> Result<Vec<CloudResource>, CloudError> {
        let mut resources = Vec::new();
        let mut page = Some(1);
        while let Some(n) = page {
            let endpoint = format!("/{}?page={n}&per_page={PER_PAGE}", collection(kind));
            let body = self.send(reqwest::Method::GET, &endpoint).await?;
            let response: ListResponse = Self::parse(&endpoint, &body)?;
            resources.extend(response.items.into_iter().map(|item| CloudResource {
                kind,
                id: item.id,
                name: item.name,
            }));
            page = response.meta.pagination.next_page;
        }
        Ok(resources)
    }

    async fn delete(&self, resource: &CloudResource) -> Result<Option<ActionId>, CloudError> {
        let endpoint = format!("/{}/{}", collection(resource.kind), resource.id);
        let body = self.send(reqwest::Method::DELETE, &endpoint).await?;
        if body.is_empty() {
            return Ok(None);
        }
        let response: ActionResponse = Self::parse(&endpoint, &body)?;
        Ok(Some(ActionId(response.action.id)))
    }

    async fn wait_for_action(&self, action: ActionId) -> Result<(), CloudError> {
        let endpoint = format!("/actions/{}", action.0);
        loop {
            let body = self.send(reqwest::Method::GET, &endpoint).await?;
            let ActionResponse { action: state } = Self::parse(&endpoint, &body)?;
            match state.status.as_str() {
                "success" => return Ok(()),
                "error" => {
                    let (code, message) = state
                        .error
                        .map(|e| (e.code, e.message))
                        .unwrap_or_else(|| ("unknown".to_owned(), "no error details".to_owned()));
                    return Err(CloudError::ActionFailed { action, code, message });
                }
                _ => tokio::time::sleep(self.action_poll_interval).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::Router;
    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{delete, get};
    use serde_json::json;

    const TOKEN: &str = "test-token";

    #[derive(Default)]
    struct Fake {
        action_polls: AtomicU32,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer test-token")
    }

    async fn list_servers(headers: HeaderMap, Query(q): Query<HashMap<String, String>>) -> impl IntoResponse {
        if !authorized(&headers) {
            return (
                StatusCode::UNAUTHORIZED,
                axum::Json(json!({"error": {"code": "unauthorized", "message": "unable to authenticate"}})),
            );
        }
        let body = match q.get("page").map(String::as_str) {
            Some("1") => json!({
                "servers": [{"id": 1, "name": "cp-1"}, {"id": 2, "name": "worker-1"}],
                "meta": {"pagination": {"page": 1, "next_page": 2}}
            }),
            _ => json!({
                "servers": [{"id": 3, "name": "worker-2"}],
                "meta": {"pagination": {"page": 2, "next_page": null}}
            }),
        };
        (StatusCode::OK, axum::Json(body))
    }

    async fn delete_server(Path(id): Path<u64>) -> impl IntoResponse {
        axum::Json(json!({"action": {"id": 100 + id, "status": "running", "error": null}}))
    }

    async fn action(State(fake): State<Arc<Fake>>, Path(id): Path<u64>) -> impl IntoResponse {
        let polls = fake.action_polls.fetch_add(1, Ordering::SeqCst);
        let body = match (id, polls) {
            (999, _) => json!({"action": {"id": id, "status": "error", "error": {"code": "action_failed", "message": "server is locked"}}}),
            (_, 0) => json!({"action": {"id": id, "status": "running", "error": null}}),
            _ => json!({"action": {"id": id, "status": "success", "error": null}}),
        };
        axum::Json(body)
    }

    async fn delete_load_balancer() -> impl IntoResponse {
        (
            StatusCode::LOCKED,
            axum::Json(json!({"error": {"code": "locked", "message": "resource is locked"}})),
        )
    }

    async fn serve() -> (String, Arc<Fake>) {
        let fake = Arc::new(Fake::default());
        let app = Router::new()
            .route("/servers", get(list_servers))
            .route("/servers/:id", delete(delete_server))
            .route("/load_balancers/:id", delete(delete_load_balancer))
            .route("/networks/:id", delete(|| async { StatusCode::NO_CONTENT }))
            .route("/actions/:id", get(action))
            .with_state(fake.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (base_url, fake)
    }

    fn client(base_url: &str, token: &str) -> HetznerCloud {
        HetznerCloud::new(reqwest::Client::new(), token)
            .with_base_url(base_url)
            .with_action_poll_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn lists_every_page() {
        let (base_url, _) = serve().await;
        let servers = client(&base_url, TOKEN).list(ResourceKind::Server).await.unwrap();
        let names: Vec<_> = servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["cp-1", "worker-1", "worker-2"]);
        assert!(servers.iter().all(|s| s.kind == ResourceKind::Server));
    }

    #[tokio::test]
    async fn api_errors_carry_code() {
        let (base_url, _) = serve().await;
        let err = client(&base_url, "wrong").list(ResourceKind::Server).await.unwrap_err();
        assert!(
            matches!(&err, CloudError::Api { status: 401, code, .. } if code == "unauthorized"),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn server_delete_returns_action_to_await() {
        let (base_url, fake) = serve().await;
        let cloud = client(&base_url, TOKEN);
        let server = CloudResource {
            kind: ResourceKind::Server,
            id: 7,
            name: "worker-1".to_owned(),
        };

        let action = cloud.delete(&server).await.unwrap();
        assert_eq!(action, Some(ActionId(107)));
        cloud.wait_for_action(ActionId(107)).await.unwrap();
        assert_eq!(fake.action_polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_action_is_an_error() {
        let (base_url, _) = serve().await;
        let err = client(&base_url, TOKEN).wait_for_action(ActionId(999)).await.unwrap_err();
        assert!(matches!(&err, CloudError::ActionFailed { code, .. } if code == "action_failed"), "{err:?}");
    }

    #[tokio::test]
    async fn network_delete_has_no_action() {
        let (base_url, _) = serve().await;
        let network = CloudResource {
            kind: ResourceKind::Network,
            id: 5,
            name: "kubernetes-cluster".to_owned(),
        };
        assert_eq!(client(&base_url, TOKEN).delete(&network).await.unwrap(), None);
    }

    #[tokio::test]
    async fn locked_resource() {
        let (base_url, _) = serve().await;
        let lb = CloudResource {
            kind: ResourceKind::LoadBalancer,
            id: 9,
            name: "ingress".to_owned(),
        };
        let err = client(&base_url, TOKEN).delete(&lb).await.unwrap_err();
        assert_eq!(err.to_string(), "/load_balancers/9 returned HTTP 423: resource is locked (locked)");
    }
}
