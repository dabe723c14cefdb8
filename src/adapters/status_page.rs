use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
};

use crate::config::RoutingStrategy;

/// Facts shown on the read-only status page.
#[derive(Debug, Clone)]
pub struct StatusPage {
    pub api_addr: SocketAddr,
    pub status_addr: SocketAddr,
    pub eligible_providers: usize,
    pub total_providers: usize,
    pub strategy: RoutingStrategy,
}

impl StatusPage {
    pub fn into_router(self) -> Router {
        Router::new()
            .route("/", get(render))
            .fallback(|| async { StatusCode::NOT_FOUND })
            .with_state(Arc::new(self))
    }

    fn render_html(&self) -> String {
        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>ccenv status</title>
  <style>
    body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 720px; margin: 2rem auto; padding: 1rem; background: #f5f5f5; color: #333; }}
    .card {{ background: #fff; padding: 2rem; border-radius: 8px; box-shadow: 0 2px 4px rgba(0,0,0,0.1); }}
    td {{ padding: 0.3rem 1rem 0.3rem 0; }}
    code {{ background: #eee; padding: 0.1rem 0.3rem; border-radius: 3px; }}
  </style>
</head>
<body>
  <div class="card">
    <h1>ccenv</h1>
    <p>The proxy is running.</p>
    <table>
      <tr><td>API endpoint</td><td><code>http://{api}</code></td></tr>
      <tr><td>Status page</td><td><code>http://{status}</code></td></tr>
      <tr><td>Providers</td><td>{eligible} active / {total} configured</td></tr>
      <tr><td>Routing</td><td>{strategy}</td></tr>
      <tr><td>Server time</td><td>{now}</td></tr>
      <tr><td>Version</td><td>{version}</td></tr>
    </table>
  </div>
</body>
</html>
"#,
            api = self.api_addr,
            status = self.status_addr,
            eligible = self.eligible_providers,
            total = self.total_providers,
            strategy = self.strategy,
            now = chrono::Utc::now().to_rfc3339(),
            version = env!("CARGO_PKG_VERSION"),
        )
    }
}

async fn render(State(page): State<Arc<StatusPage>>) -> Response {
    Html(page.render_html()).into_response()
}
