//! Placeholder UI server.
//!
//! The real web UI is an external asset bundle; this server exists so the
//! `--ui` flag has an address to point a browser at. It serves a single
//! page that tells the operator where the API lives.

use axum::response::Html;
use axum::routing::get;
use axum::Router;

/// Build the UI router, pointing the page at `api_addr`.
pub fn router(api_addr: String) -> Router {
  let page = format!(
    "<!DOCTYPE html>\n<html>\n<head><title>hyperfox</title></head>\n\
     <body>\n<h1>hyperfox</h1>\n\
     <p>The capture API is served at <code>{api_addr}</code>.</p>\n\
     <p>Point a UI bundle or an API client at it; pass the access token \
     printed at startup via <code>Authorization</code> or the \
     <code>auth</code> query parameter.</p>\n</body>\n</html>\n"
  );
  Router::new().route(
    "/",
    get(move || {
      let page = page.clone();
      async move { Html(page) }
    }),
  )
}
