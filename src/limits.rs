use crate::error::{SchedError, SchedResult};

pub const FILENAME_MAX: usize = 127;
pub const JOB_ERROR_MAX: usize = 255;
pub const SEQ_NAME_MAX: usize = 255;
pub const SEQ_DATA_MAX: usize = 1024 * 1024;
pub const MATCH_MAX: usize = 5 * 1024 * 1024;
pub const SEQS_PER_JOB: usize = 64;
pub const NUM_SLOTS: usize = 64;
pub const PROFILE_NAME_MAX: usize = 63;
pub const ABC_NAME_MAX: usize = 15;
pub const PROFILE_TYPEID_MAX: usize = 15;
pub const VERSION_MAX: usize = 15;
pub const PROGRESS_MAX: i64 = 100;

pub(crate) fn check_len(field: &str, value: &str, max: usize) -> SchedResult<()> {
    if value.len() > max {
        return Err(SchedError::LimitExceeded(format!(
            "{} is {} bytes, maximum is {}",
            field,
            value.len(),
            max
        )));
    }
    Ok(())
}

/// Longest prefix of `msg` that fits in `max` bytes without splitting a
/// UTF-8 code point.
pub fn clamp(msg: &str, max: usize) -> &str {
    if msg.len() <= max {
        return msg;
    }
    let mut end = max;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    &msg[..end]
}
