//! # croon
//!
//! A small route-and-filter web framework: declare routes as
//! `(method, pattern) → handler`, add before/after filters, settings and
//! error handlers, and let a synchronous dispatch engine turn every request
//! into a response.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use croon::app::App;
//! use croon::handler::Signal;
//! use croon::middleware::Logger;
//! use croon::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut app = App::new();
//!     app.get("/hello/:name", |ctx| {
//!         let name = ctx.param("name").unwrap_or("world").to_owned();
//!         Ok(Signal::body(format!("Hello, {name}!")))
//!     })?;
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     println!("Listening on http://127.0.0.1:8080");
//!     server.run(Logger::new(app.build())).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Dispatch without a server
//!
//! An [`Application`] answers [`Environment`]s directly, which is how tests
//! and embedding hosts drive it:
//!
//! ```
//! use croon::{App, Environment, Method, Signal, StatusCode};
//!
//! let mut app = App::new();
//! app.set("environment", "test");
//! app.get("/files/*", |ctx| Ok(Signal::body(ctx.params().splat().join("/"))))
//!     .unwrap();
//! let app = app.build();
//!
//! let response = app.call(Environment::new(Method::Get, "/files/a/b.txt"));
//! assert_eq!(response.status(), StatusCode::OK);
//! assert_eq!(response.into_body().into_bytes(), "a/b.txt");
//! ```

// ── Definition and dispatch ───────────────────────────────────────────────────
pub mod app;
pub mod context;
pub mod dispatch;
pub mod handler;
pub mod pattern;
pub mod router;
pub mod settings;

// ── Boundary and transport ────────────────────────────────────────────────────
pub mod http;
pub mod middleware;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use app::{App, Application};
pub use context::{Params, RequestContext};
pub use handler::{HandlerError, HandlerResult, Signal};
pub use http::{Body, Environment, Headers, Method, Response, StatusCode};
pub use middleware::{Logger, Middleware, Stage};
pub use pattern::{Pattern, PatternError};
pub use server::{Server, ServerError};
pub use settings::Settings;
