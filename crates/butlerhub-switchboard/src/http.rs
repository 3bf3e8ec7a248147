pub mod health;
pub mod notify;
pub mod route;
pub mod webhooks;
