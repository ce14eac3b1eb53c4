//! # Repository Layer
//!
//! Repositories encapsulate SeaORM operations for the database entities,
//! providing tenant-aware access patterns for handlers and workers. Errors
//! propagate as [`sea_orm::DbErr`]; the HTTP layer converts them through the
//! `ApiError` mapper and the worker pool classifies them as retryable.

pub mod call;
pub mod contact;
pub mod integration;
pub mod job;
pub mod lead;
pub mod notification;
pub mod tenant;
pub mod webhook_event;

pub use call::CallRepository;
pub use contact::ContactRepository;
pub use integration::IntegrationRepository;
pub use job::JobRepository;
pub use lead::LeadRepository;
pub use notification::NotificationRepository;
pub use tenant::TenantRepository;
pub use webhook_event::WebhookEventRepository;
