//! Peer identity: `<hostname>/<fragment>`, stable for the process lifetime.

use std::sync::OnceLock;

use rand::seq::SliceRandom;

const WORD_LIST_RAW: &str = include_str!("../assets/words.txt");
const FALLBACK_HOSTNAME: &str = "unknown-host";

fn word_list() -> &'static [&'static str] {
    static WORDS: OnceLock<Vec<&'static str>> = OnceLock::new();
    WORDS.get_or_init(|| {
        WORD_LIST_RAW
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect()
    })
}

/// A peer's stable identity, used both as the gossip message prefix and the
/// key in every peer's `peers` map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generates `<hostname>/<fragment>`. Collisions across peers are
    /// tolerated by design: membership is keyed by this string, and peers
    /// expire independently of one another.
    pub fn generate() -> Self {
        let hostname = hostname_or_fallback();
        let fragment = pick_fragment();
        PeerId(format!("{hostname}/{fragment}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn hostname_or_fallback() -> String {
    match hostname_from_os() {
        Some(name) if !name.is_empty() => name,
        _ => {
            log::warn!("could not determine hostname, falling back to {FALLBACK_HOSTNAME}");
            FALLBACK_HOSTNAME.to_string()
        }
    }
}

#[cfg(unix)]
fn hostname_from_os() -> Option<String> {
    let mut buf = vec![0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return None;
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    buf.truncate(len);
    String::from_utf8(buf).ok()
}

#[cfg(not(unix))]
fn hostname_from_os() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

fn pick_fragment() -> &'static str {
    let words = word_list();
    words
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("peer")
}
