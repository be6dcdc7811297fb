//! Default prompt templates bundled at compile time.

/// Story writer - turns the user prompt (plus revision notes) into filmable scenes
pub const WRITER: &str = include_str!("defaults/writer.md");

/// Text judge - scores story candidates on the three ranking axes
pub const JUDGE: &str = include_str!("defaults/judge.md");

/// Prompt critic - grades image prompts during refinement
pub const PROMPT_CRITIC: &str = include_str!("defaults/prompt_critic.md");

/// Refiner - rewrites an image prompt from critic feedback
pub const REFINER: &str = include_str!("defaults/refiner.md");

/// All default prompts with their slugs
pub fn all_defaults() -> Vec<(&'static str, &'static str)> {
    vec![
        ("writer", WRITER),
        ("judge", JUDGE),
        ("prompt_critic", PROMPT_CRITIC),
        ("refiner", REFINER),
    ]
}
