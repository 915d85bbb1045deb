pub mod auth;
pub mod feed;
pub mod init;
pub mod lease;
pub mod reconciler;
pub mod signature;
pub mod sites;
pub mod subscriptions;
pub mod twitch;
pub mod webhooks;
pub mod websub;
pub mod youtube;
