// Conversation sync core for the messaging dashboard
pub mod backend;  // Collaborator traits and adapters for the hosted backend
pub mod error;
pub mod models;
pub mod settings;
pub mod store;
pub mod sync;  // Subscription manager and send reconciler

// Re-export main types for convenience
pub use error::{SyncError, SyncResult};
pub use models::*;
pub use sync::{ConversationSync, ConversationView, SyncConfig};
