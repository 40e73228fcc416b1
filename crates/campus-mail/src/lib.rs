//! # Campus Mail
//!
//! Email notification jobs: payload types, the mail transport contract, the
//! `send-email` handler and producer helpers.

pub mod handler;
pub mod mailer;
pub mod payload;
pub mod queue;

pub use handler::SendEmailHandler;
pub use mailer::{LogMailer, MailError, Mailer};
pub use payload::{EmailPayload, EmailReceipt};
pub use queue::EmailQueue;

/// Job kind handled by [`SendEmailHandler`]
pub const SEND_EMAIL: &str = "send-email";
