//! The request pipeline.
//!
//! ```text
//! instantiate ─► before filters ─► route loop ─► after filters ─► finalize
//!                    │ halt                                          ▲
//!                    └───────────────────────────────────────────────┘
//! ```
//!
//! Handlers steer the pipeline through the [`Signal`] they return. A
//! [`HandlerError`] raised anywhere, or a handler panic, is turned into a
//! response by the error handlers; nothing escapes [`dispatch`].

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{debug, error, trace, warn};

use crate::app::Application;
use crate::context::RequestContext;
use crate::handler::{Handler, HandlerError, Signal};
use crate::http::{Body, Environment, Method, Response, StatusCode};
use crate::pattern::MatchOptions;
use crate::router::FilterKind;

const NOT_FOUND_BODY: &str = "<h1>Not Found</h1>";
const INTERNAL_ERROR_BODY: &str = "<h1>Internal Server Error</h1>";

// Whether the pipeline keeps going after a filter chain.
enum Flow {
    Continue,
    Halted,
}

/// Run one request through `app` and produce its response.
pub fn dispatch(app: &Application, env: Environment) -> Response {
    let settings = app.settings();
    let options = settings.match_options();
    let mut ctx = RequestContext::new(env, settings);

    let method = ctx.method().clone();
    let path = ctx.path().to_owned();
    debug!(%method, path = path.as_str(), "dispatching request");

    match run_filters(app, FilterKind::Before, &method, &path, options, &mut ctx) {
        Ok(Flow::Halted) => {
            debug!(%method, path = path.as_str(), "halted in before filter");
            return finalize(ctx);
        }
        Ok(Flow::Continue) => {
            if let Err(err) = route(app, &method, &path, options, &mut ctx) {
                handle_error(app, &mut ctx, err);
            }
        }
        Err(err) => handle_error(app, &mut ctx, err),
    }

    if let Err(err) = run_filters(app, FilterKind::After, &method, &path, options, &mut ctx) {
        handle_error(app, &mut ctx, err);
    }

    finalize(ctx)
}

fn run_filters(
    app: &Application,
    kind: FilterKind,
    method: &Method,
    path: &str,
    options: MatchOptions,
    ctx: &mut RequestContext,
) -> Result<Flow, HandlerError> {
    for (filter, captures) in app.filters(kind, method, path, options) {
        // guard captures are scoped to this filter
        let shadowed = ctx.params_mut().overlay(captures);
        let result = invoke(filter.handler(), ctx);
        ctx.params_mut().unwind(shadowed);

        if let Signal::Halt { status, body } = result? {
            apply_halt(ctx, status, body);
            return Ok(Flow::Halted);
        }
    }
    Ok(Flow::Continue)
}

fn route(
    app: &Application,
    method: &Method,
    path: &str,
    options: MatchOptions,
    ctx: &mut RequestContext,
) -> Result<(), HandlerError> {
    for (route, captures) in app.routes(method, path, options) {
        let snapshot = ctx.snapshot();
        ctx.params_mut().merge(captures);

        if !route.conditions_hold(ctx) {
            trace!(pattern = route.pattern().source(), "route conditions rejected request");
            ctx.restore(snapshot);
            continue;
        }

        trace!(pattern = route.pattern().source(), "invoking route");
        match invoke(route.handler(), ctx) {
            Ok(Signal::Pass) => {
                trace!(pattern = route.pattern().source(), "route passed");
                ctx.restore(snapshot);
            }
            result => {
                ctx.commit(snapshot);
                settle(ctx, result?);
                return Ok(());
            }
        }
    }

    not_found(app, ctx)
}

fn not_found(app: &Application, ctx: &mut RequestContext) -> Result<(), HandlerError> {
    debug!(method = %ctx.method(), path = ctx.path(), "no route matched");
    ctx.set_status(StatusCode::NOT_FOUND);

    if let Some(handler) = app.status_handler(StatusCode::NOT_FOUND) {
        let signal = invoke(handler, ctx)?;
        if !signal.is_pass() {
            settle(ctx, signal);
            return Ok(());
        }
    }

    ctx.set_body(NOT_FOUND_BODY);
    Ok(())
}

fn handle_error(app: &Application, ctx: &mut RequestContext, err: HandlerError) {
    let status = err.status();
    if ctx.settings().flag("dump_errors") {
        error!(
            kind = err.kind(),
            message = err.message(),
            method = %ctx.method(),
            path = ctx.path(),
            "handler failed"
        );
    }

    ctx.set_status(status);
    ctx.set_error(err.clone());

    if status.is_server_error() && ctx.settings().flag("show_exceptions") {
        let diagnostic = diagnostic(ctx, &err);
        ctx.content_type("text/plain;charset=utf-8");
        ctx.set_body(diagnostic);
        return;
    }

    let candidates: [Option<&Handler>; 3] = [
        app.error_handler(err.kind()),
        app.any_error_handler(),
        app.status_handler(status),
    ];
    for handler in candidates.into_iter().flatten() {
        match invoke(handler, ctx) {
            Ok(Signal::Pass) => continue,
            Ok(signal) => {
                settle(ctx, signal);
                return;
            }
            Err(nested) => {
                warn!(kind = nested.kind(), message = nested.message(), "error handler failed");
                break;
            }
        }
    }

    ctx.set_status(status);
    ctx.set_body(fallback_body(status));
}

/// Run `handler`, turning a panic into a `Panic` error.
fn invoke(handler: &Handler, ctx: &mut RequestContext) -> Result<Signal, HandlerError> {
    catch_unwind(AssertUnwindSafe(|| handler(ctx))).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        error!(message = message.as_str(), "handler panicked");
        Err(HandlerError::new("Panic", message))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("handler panicked")
    }
}

fn diagnostic(ctx: &RequestContext, err: &HandlerError) -> String {
    let query = ctx
        .env()
        .query_string()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    format!(
        "{}: {}\n\n{} {}{}\n",
        err.kind(),
        err.message(),
        ctx.method(),
        ctx.path(),
        query
    )
}

fn fallback_body(status: StatusCode) -> &'static str {
    if status == StatusCode::NOT_FOUND {
        NOT_FOUND_BODY
    } else {
        INTERNAL_ERROR_BODY
    }
}

fn settle(ctx: &mut RequestContext, signal: Signal) {
    match signal {
        Signal::Normal(body) => ctx.set_body(body),
        Signal::Halt { status, body } => apply_halt(ctx, status, body),
        Signal::Pass => {}
    }
}

fn apply_halt(ctx: &mut RequestContext, status: Option<StatusCode>, body: Option<Body>) {
    if let Some(status) = status {
        ctx.set_status(status);
    }
    if let Some(body) = body {
        ctx.set_body(body);
    }
}

fn finalize(ctx: RequestContext) -> Response {
    let head = *ctx.method() == Method::Head;
    let default_type = ctx
        .settings()
        .string("default_content_type")
        .map(str::to_owned);

    let (status, mut headers, mut body) = ctx.into_response().into_parts();
    if !body.is_empty() && !headers.contains("content-type") {
        if let Some(media_type) = default_type {
            headers.set("Content-Type", media_type);
        }
    }
    if head {
        body = Body::empty();
    }

    Response::from_parts(status, headers, body)
}
