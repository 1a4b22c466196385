mod convert;
pub mod error;
pub mod fcm;
pub mod push;
pub mod service;

pub use error::ChatError;
pub use push::{LogNotifier, PushNotification, PushNotifier};
pub use service::{ChatService, DeliveryReceipt};
