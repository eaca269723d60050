//! Voice processing module
//!
//! Streaming transcription, end-of-speech detection and reply playback.
//! Recognition and synthesis themselves are remote collaborators behind the
//! traits in [`stt`] and [`tts`].

pub mod delivery;
pub mod link;
pub mod normalize;
pub mod silence;
pub mod stt;
pub mod tts;
pub mod wav;

pub use delivery::{DeliveryOutcome, deliver};
pub use link::{ReconnectPolicy, TranscriptSink, UpstreamLink};
pub use normalize::collapse_repeats;
pub use silence::SilenceDetector;
pub use stt::{DeepgramLive, LinkEvent, TranscriptEvent, TranscriptionHandle, TranscriptionService};
pub use tts::{PcmStream, SpeechSynthesizer, SynthesizedAudio, TextToSpeech};
pub use wav::{pcm_to_wav, write_wav};
