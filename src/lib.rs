//! Cadence Gateway - turn-taking voice conversations over WebSocket
//!
//! This library drives a spoken conversation with one peer per connection:
//! - Streaming transcription with automatic reconnect
//! - End-of-speech detection and reply generation
//! - Chunked reply playback that stops as soon as the user talks over it
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 WebSocket peer (/ws)                  │
//! │      control JSON  │  mic PCM  ▲  reply PCM          │
//! └────────────────────┬─────────────────────────────────┘
//!                      │
//! ┌────────────────────▼─────────────────────────────────┐
//! │                  Session (actor)                      │
//! │  Silence detector │ Upstream link │ Audio delivery   │
//! └────────────────────┬─────────────────────────────────┘
//!                      │
//! ┌────────────────────▼─────────────────────────────────┐
//! │                  Collaborators                        │
//! │   Deepgram (STT)  │  Groq (LLM)  │  OpenAI (TTS)      │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod session;
pub mod voice;

pub use agent::{ChatClient, ChatMessage, Conversation, Generator};
pub use api::{ApiServer, ApiServerBuilder, ApiState};
pub use config::Config;
pub use error::{Error, Result};
pub use session::{Phase, Session, SessionHandle, SessionOptions, SessionServices};
