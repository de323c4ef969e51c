pub mod auth;
pub mod calls;
pub mod chat;
pub mod contacts;
mod convert;
pub mod error;
pub mod health;
pub mod middleware;
pub mod notifications;
pub mod orders;
pub mod qr;
pub mod state;
pub mod sweeper;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post, put},
};

use crate::middleware::require_auth;
use crate::state::AppState;

/// All REST routes, mounted under `/api`.
pub fn router(state: AppState) -> Router {
    // Open routes: either unauthenticated, or authenticating a stranger token
    // (or an owner token) inside the handler.
    let public_routes = Router::new()
        .route("/health", get(health::health))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/google", post(auth::google_sign_in))
        .route("/qr/scan/{code}", get(qr::scan))
        .route("/chat/stranger/send", post(chat::send_as_stranger))
        .route("/chat/stranger/messages", get(chat::stranger_messages))
        .route("/call/initiate", post(calls::initiate))
        .route("/call/{call_id}/accept", put(calls::accept))
        .route("/call/{call_id}/decline", put(calls::decline))
        .route("/call/{call_id}/end", put(calls::end));

    let protected_routes = Router::new()
        .route(
            "/auth/profile",
            get(auth::get_profile).patch(auth::update_profile),
        )
        .route("/auth/account", axum::routing::delete(auth::delete_account))
        .route("/qr/create", post(qr::create_qr))
        .route("/qr/my-qrs", get(qr::my_qrs))
        .route("/chat/send", post(chat::send_as_owner))
        .route("/chat/sessions", get(chat::list_sessions))
        .route("/chat/sessions/{session_id}/messages", get(chat::session_messages))
        .route("/chat/sessions/{session_id}/close", put(chat::close_session))
        .route("/call/{call_id}/escalation", put(calls::record_escalation))
        .route("/call/history/{qr_id}", get(calls::history))
        .route(
            "/emergency/contacts",
            get(contacts::list_contacts).post(contacts::add_contact),
        )
        .route("/emergency/contacts/bulk", post(contacts::add_contacts_bulk))
        .route("/emergency/contacts/reorder", put(contacts::reorder_contacts))
        .route(
            "/emergency/contacts/{contact_id}",
            put(contacts::update_contact).delete(contacts::delete_contact),
        )
        .route("/updates", get(notifications::list_updates))
        .route("/updates/read-all", put(notifications::mark_all_read))
        .route("/updates/{notification_id}/read", put(notifications::mark_read))
        .route(
            "/orders",
            get(orders::list_orders).post(orders::create_order),
        )
        .route("/orders/{order_id}/confirm", post(orders::confirm_order))
        .layer(axum_middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new().nest(
        "/api",
        Router::new()
            .merge(public_routes)
            .merge(protected_routes)
            .with_state(state),
    )
}
