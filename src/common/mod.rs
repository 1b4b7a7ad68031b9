use crate::warn;

use regex::Regex;

use std::collections::HashMap;

pub mod exec;

/// Dimension name carrying the reporting host
pub const HOSTNAME: &str = "hostname";

/// Dimension name carrying the device a measurement belongs to
pub const DEVICE: &str = "device";

const MAX_DIMENSION_LEN: usize = 255;
const RESTRICTED_CHARS: &[char] = &['>', '<', '=', '{', '}', '(', ')', ',', '"', '\\', ';', '&'];

pub type Dimensions = HashMap<String, String>;

/// Returns the system hostname, falling back to `localhost` when it cannot be
/// determined.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];

    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return "localhost".into();
    }

    let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    match std::str::from_utf8(&buf[..len]) {
        Ok(name) if !name.is_empty() => name.to_string(),
        _ => "localhost".into(),
    }
}

/// Whether a dimension key or value is acceptable downstream.
pub fn valid_dimension(s: &str) -> bool {
    !s.is_empty() && s.chars().count() <= MAX_DIMENSION_LEN && !s.contains(RESTRICTED_CHARS)
}

/// Merge scraped key/value pairs into `dimensions`, dropping invalid pairs.
/// Merged pairs override existing entries.
pub fn merge_dimensions<'a, I>(dimensions: &mut Dimensions, pairs: I)
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    for (key, value) in pairs {
        if valid_dimension(key) && valid_dimension(value) {
            dimensions.insert(key.clone(), value.clone());
        } else {
            warn!("dropping invalid dimension: {key}={value}");
        }
    }
}

/// Combine name patterns into a single expression matching any of them at
/// the start of a name. Returns `None` when there are no patterns.
pub fn match_any(patterns: &[String]) -> Result<Option<Regex>, regex::Error> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let alternatives: Vec<String> = patterns.iter().map(|p| format!("(?:{p})")).collect();

    Regex::new(&format!("^(?:{})", alternatives.join("|"))).map(Some)
}
