//! Concrete channel adapters.
//!
//! One module per surface. Adapters never import each other; anything two
//! surfaces share belongs in the contract or registry modules.

pub mod discord;
pub mod imessage;
pub mod signal;
pub mod slack;
pub mod telegram;
pub mod webchat;
pub mod whatsapp;

pub use discord::DiscordAdapter;
pub use imessage::ImessageAdapter;
pub use signal::SignalAdapter;
pub use slack::SlackAdapter;
pub use telegram::TelegramAdapter;
pub use webchat::WebchatAdapter;
pub use whatsapp::WhatsappAdapter;
