pub mod agent;
pub mod ai_detect;
pub mod comparative;
pub mod duplicate;
pub mod ela;
pub mod exif;
pub mod phash;
pub mod reverse_search;
pub mod vision;

pub use agent::{AgentError, AgentImage, AuthenticityAgent, ItemContext};

pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
