//! Strm classification and redirect resolution.

mod classify;
mod engine;
mod lookup;
mod playback_info;

pub use classify::{StrmClassification, StrmClassifier, classify_content, is_strm_path};
pub use engine::{PreloadOutcome, Resolution, ResolutionEngine, item_id_from_path};
pub use lookup::{LookupError, MediaLookup, WarmOutcome};
pub use playback_info::{api_key_pair, media_source_ids, rewrite_playback_info};
