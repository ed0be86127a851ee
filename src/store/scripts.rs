use lazy_static::lazy_static;
use redis::Script;

lazy_static! {
    pub static ref TOKEN_BUCKET_ADMIT: Script =
        Script::new(include_str!("../../scripts/token_bucket_admit.lua"));
    pub static ref TOKEN_BUCKET_QUOTA: Script =
        Script::new(include_str!("../../scripts/token_bucket_quota.lua"));
    pub static ref SLIDING_WINDOW_ADMIT: Script =
        Script::new(include_str!("../../scripts/sliding_window_admit.lua"));
    pub static ref SLIDING_WINDOW_QUOTA: Script =
        Script::new(include_str!("../../scripts/sliding_window_quota.lua"));
}

/// All scripts, for warm-up loading at startup
pub fn all() -> [&'static Script; 4] {
    [
        &TOKEN_BUCKET_ADMIT,
        &TOKEN_BUCKET_QUOTA,
        &SLIDING_WINDOW_ADMIT,
        &SLIDING_WINDOW_QUOTA,
    ]
}
