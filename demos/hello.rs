//! A small croon application served over TCP.
//!
//! ```text
//! RUST_LOG=croon=debug cargo run --example hello
//! curl localhost:8080/hello/ferris                       # JSON (curl accepts */*)
//! curl localhost:8080/hello/ferris -H 'Accept: text/html'
//! curl -X POST -d 'title=buy milk' localhost:8080/todos
//! curl localhost:8080/admin/stats -H 'Authorization: Bearer letmein'
//! ```

use std::sync::{Arc, Mutex};

use croon::app::App;
use croon::handler::{HandlerError, Signal};
use croon::http::StatusCode;
use croon::middleware::{Logger, Middleware};
use croon::router::conditions;
use croon::server::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "croon=info,hello=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let todos: Arc<Mutex<Vec<String>>> = Arc::default();

    let mut site = App::new();
    site.set("title", "croon demo");

    site.before(|ctx| {
        ctx.set_header("X-Powered-By", "croon");
        Ok(Signal::next())
    });

    site.get("/", |ctx| {
        let title = ctx.settings().string("title").unwrap_or("croon").to_owned();
        Ok(Signal::body(format!("<h1>{title}</h1>")))
    })?;

    // Tried first; clients that do not accept JSON fall through to the plain route.
    site.route_when(
        croon::http::Method::Get,
        "/hello/:name",
        vec![conditions::provides("application/json")],
        |ctx| {
            ctx.content_type("application/json");
            let body = serde_json::json!({ "hello": ctx.param("name") });
            Ok(Signal::body(body.to_string()))
        },
    )?;

    site.get("/hello/:name", |ctx| {
        let name = ctx.param("name").unwrap_or("world").to_owned();
        Ok(Signal::body(format!("Hello, {name}!")))
    })?;

    let list = Arc::clone(&todos);
    site.get("/todos", move |ctx| {
        let items = list.lock().map_err(|_| HandlerError::new("Poisoned", "todo list lock"))?;
        ctx.content_type("application/json");
        Ok(Signal::body(serde_json::to_string(&*items)?))
    })?;

    let list = Arc::clone(&todos);
    site.post("/todos", move |ctx| {
        let Some(title) = ctx.param("title").map(str::to_owned) else {
            return Ok(Signal::halt_with(StatusCode::BAD_REQUEST, "missing title"));
        };
        list.lock()
            .map_err(|_| HandlerError::new("Poisoned", "todo list lock"))?
            .push(title);
        ctx.set_status(StatusCode::CREATED);
        Ok(Signal::body("created"))
    })?;

    site.get("/boom", |_| Err(HandlerError::new("Boom", "something broke")))?;
    site.error("Boom", |ctx| {
        let message = ctx.error().map(|e| e.message().to_owned()).unwrap_or_default();
        Ok(Signal::body(format!("<p>recovered from: {message}</p>")))
    });
    site.not_found(|ctx| Ok(Signal::body(format!("<p>{} is not here</p>", ctx.path()))));

    let site = site.build();

    // Same filters and settings, plus an authenticated area.
    let mut admin = App::extend(&site);
    admin.before_at("/admin/*", |ctx| {
        if ctx.header("authorization") != Some("Bearer letmein") {
            return Ok(Signal::halt_with(StatusCode::UNAUTHORIZED, "unauthorized"));
        }
        Ok(Signal::next())
    })?;
    let stats = Arc::clone(&todos);
    admin.get("/admin/stats", move |_| {
        let count = stats.lock().map(|items| items.len()).unwrap_or_default();
        Ok(Signal::body(format!("{count} todos")))
    })?;

    let stage = Logger::new(Middleware::wrap(admin.build(), site));

    let server = Server::bind("127.0.0.1:8080").await?;
    tracing::info!(address = %server.local_addr(), "demo ready");
    server.run(stage).await?;
    Ok(())
}
