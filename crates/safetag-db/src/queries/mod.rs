//! Typed query methods on [`Database`](crate::Database), one module per entity.

mod calls;
mod chat;
mod contacts;
mod notifications;
mod orders;
mod qr_codes;
mod users;

pub(crate) use notifications::insert_notification;
