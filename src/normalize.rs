//! Filename normalization: turns release-style names such as
//! `Deadpool.2.2018.BluRay.720p.x264-GROUP.mkv` into a comparable token set.
//!
//! Everything here is a pure function of its input so matching and duplicate
//! detection stay reproducible.

use std::collections::{BTreeSet, HashSet};
use std::path::{Component, Path};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::MediaKind;

pub type TokenSet = BTreeSet<String>;

/// Container extensions dropped before tokenizing. Anything else after the
/// last dot is treated as part of the title ("Mr. Robot").
pub const CONTAINER_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "mov", "wmv", "flv", "webm", "m4v", "mpg", "mpeg", "m2ts", "ts", "iso",
    "srt",
];

static RELEASE_TOKENS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // resolution
        "480p", "576p", "720p", "1080p", "1080i", "2160p", "4320p", "4k", "8k", "uhd", "fhd",
        // video
        "x264", "x265", "h264", "h265", "hevc", "avc", "xvid", "divx", "av1", "vp9", "10bit",
        "8bit", "hdr", "hdr10", "dv", "dovi", "sdr", "remux",
        // audio
        "aac", "ac3", "eac3", "dts", "dtshd", "truehd", "atmos", "flac", "mp3", "dd", "ddp", "opus",
        // source
        "bluray", "bdrip", "brrip", "dvdrip", "dvdscr", "dvd", "webrip", "webdl", "web", "hdtv",
        "hdrip", "pdtv", "amzn", "nf", "dsnp", "hmax", "atvp",
        // release noise
        "proper", "repack", "rerip", "internal", "limited", "readnfo", "multi", "subbed",
    ]
    .into_iter()
    .collect()
});

const STOP_WORDS: &[&str] = &["the", "a", "an", "and"];

static COMPOUND_TAGS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    let mut v = Vec::new();
    macro_rules! r {
        ($pat:expr, $replacement:expr) => {
            v.push((Regex::new($pat).expect("compound tag regex"), $replacement));
        };
    }
    r!(r"\bweb[ ._-]?dl\b", " webdl ");
    r!(r"\bblu[ ._-]?ray\b", " bluray ");
    r!(r"\bh[ .]?26([45])\b", " h26$1 ");
    r!(r"\bdts[ ._-]?hd(?:[ ._-]?ma)?\b", " dtshd ");
    r!(r"\b(ddp|dd|aac|ac3|eac3|dts|truehd|flac|opus)[ ._-]?[257][ ._][01]\b", " $1 ");
    r!(r"\b(ddp|dd)\+?[257][ ._][01]\b", " ddp ");
    v
});

static BITRATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d+(?:[.,]\d+)?[ ]?(?:kbps|mbps|kb/s|mb/s)\b").expect("bitrate regex")
});

static RELEASE_GROUP_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-[a-z0-9]+$").expect("release group regex"));

static EPISODE_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\bs\d{1,2}[ ._-]?e\d{1,3}(?:[-e]+\d{1,3})*\b",
        r"\b\d{1,2}x\d{2,3}\b",
        r"\bseason[ ._-]*\d{1,2}\b",
        r"\bepisode[ ._-]*\d{1,3}\b",
    ]
    .into_iter()
    .map(|p| Regex::new(p).expect("episode marker regex"))
    .collect()
});

static SXXEYY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bs(\d{1,2})[ ._-]?e(\d{1,3})").expect("sxxeyy regex"));
static NXNN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(\d{1,2})x(\d{2,3})\b").expect("nxnn regex"));
static SEASON_EPISODE_WORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bseason[ ._-]*(\d{1,2})\b.*?\bepisode[ ._-]*(\d{1,3})\b")
        .expect("season episode regex")
});
static SEASON_DIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:season[ ._-]*|s)(\d{1,2})$").expect("season dir regex"));
static EPISODE_IN_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:\bepisode[ ._-]*|\be|^)(\d{1,3})\b").expect("episode name regex")
});
static YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:19|20)\d{2}\b").expect("year regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EpisodeNumber {
    pub season: u32,
    pub episode: u32,
}

/// Normalize a file name or title into its comparable token set.
pub fn normalize(name: &str) -> TokenSet {
    let mut text = strip_container_extension(name).to_lowercase();
    text = strip_annotations(&text);

    for (re, replacement) in COMPOUND_TAGS.iter() {
        text = re.replace_all(&text, *replacement).into_owned();
    }

    if has_release_marker(&text) {
        text = RELEASE_GROUP_SUFFIX.replace(text.trim_end(), "").into_owned();
    }

    text = BITRATE.replace_all(&text, " ").into_owned();
    for re in EPISODE_MARKERS.iter() {
        text = re.replace_all(&text, " ").into_owned();
    }

    let cleaned: String = text
        .chars()
        .filter(|c| *c != '\'' && *c != '\u{2019}')
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    cleaned
        .split_whitespace()
        .filter(|t| !RELEASE_TOKENS.contains(t) && !STOP_WORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// Jaccard similarity of two token sets; two empty sets score 0.
pub fn jaccard(a: &TokenSet, b: &TokenSet) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn strip_container_extension(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && CONTAINER_EXTENSIONS
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext)) =>
        {
            stem
        }
        _ => name,
    }
}

/// Drop bracketed, parenthesised and braced annotations. A bare year inside
/// brackets survives as a plain token.
fn strip_annotations(name: &str) -> String {
    let mut clean = String::with_capacity(name.len());
    let mut current = String::new();
    let mut depth = 0usize;

    for ch in name.chars() {
        match ch {
            '(' | '[' | '{' => {
                if depth == 0 {
                    current.clear();
                }
                depth += 1;
            }
            ')' | ']' | '}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        let inner = current.trim();
                        if is_year(inner) {
                            clean.push(' ');
                            clean.push_str(inner);
                        }
                        clean.push(' ');
                        current.clear();
                    }
                }
            }
            _ => {
                if depth == 0 {
                    clean.push(ch);
                } else {
                    current.push(ch);
                }
            }
        }
    }

    clean
}

fn is_year(s: &str) -> bool {
    s.len() == 4 && YEAR.is_match(s)
}

fn has_release_marker(text: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .any(|t| RELEASE_TOKENS.contains(t))
}

/// Extract season/episode numbers from a path, trying the file name first
/// (`S01E02`, `1x02`, `Season 1 Episode 2`) and then the `Season N/` directory
/// convention.
pub fn parse_episode(path: &Path) -> Option<EpisodeNumber> {
    let stem = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(strip_container_extension)
        .unwrap_or_default();

    if let Some(n) = parse_episode_name(stem) {
        return Some(n);
    }

    let season_dir = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .and_then(|n| SEASON_DIR.captures(n.trim()))
        .and_then(|c| c[1].parse::<u32>().ok())?;

    let episode = EPISODE_IN_NAME
        .captures(stem.trim())
        .and_then(|c| c[1].parse::<u32>().ok())?;

    Some(EpisodeNumber {
        season: season_dir,
        episode,
    })
}

fn parse_episode_name(name: &str) -> Option<EpisodeNumber> {
    for re in [&*SXXEYY, &*NXNN, &*SEASON_EPISODE_WORDS] {
        if let Some(c) = re.captures(name) {
            let season = c[1].parse().ok()?;
            let episode = c[2].parse().ok()?;
            return Some(EpisodeNumber { season, episode });
        }
    }
    None
}

/// Guess whether a path holds a movie or an episode from its name and
/// directory layout alone.
pub fn classify_kind(path: &Path) -> MediaKind {
    if parse_episode(path).is_some() {
        return MediaKind::Episode;
    }

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_lowercase();
    if YEAR.is_match(&name) || has_release_marker(&name) {
        return MediaKind::Movie;
    }

    let in_movies_dir = path.ancestors().skip(1).any(|dir| {
        dir.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| matches!(n.to_lowercase().as_str(), "movies" | "films"))
    });
    if in_movies_dir {
        MediaKind::Movie
    } else {
        MediaKind::Unknown
    }
}

/// Tokens naming the show an episode file belongs to: the text before the
/// episode marker, or failing that the nearest directory that is not a
/// `Season N` folder.
pub fn show_tokens(path: &Path) -> TokenSet {
    let stem = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(strip_container_extension)
        .unwrap_or_default();

    let lowered = stem.to_lowercase();
    let marker_start = EPISODE_MARKERS
        .iter()
        .filter_map(|re| re.find(&lowered).map(|m| m.start()))
        .min();
    if let Some(start) = marker_start {
        let tokens = normalize(&lowered[..start]);
        if !tokens.is_empty() {
            return tokens;
        }
    }

    let dirs = path
        .parent()
        .map(|p| p.components().collect::<Vec<_>>())
        .unwrap_or_default();
    for component in dirs.iter().rev() {
        let Component::Normal(os) = component else {
            continue;
        };
        let Some(dir) = os.to_str() else {
            continue;
        };
        if SEASON_DIR.is_match(dir.trim()) {
            continue;
        }
        let tokens = normalize(dir);
        if !tokens.is_empty() {
            return tokens;
        }
    }

    TokenSet::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn set(tokens: &[&str]) -> TokenSet {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn release_names_and_catalog_titles_converge() {
        let a = normalize("Deadpool.2.2018.BluRay.720p.mkv");
        let b = normalize("Deadpool 2 (2018) [720p BluRay]");
        assert_eq!(a, set(&["deadpool", "2", "2018"]));
        assert!(jaccard(&a, &b) >= 0.8);
    }

    #[test]
    fn strips_codecs_groups_and_bitrates() {
        let tokens = normalize("Mean.Girls.2004.1080p.WEB-DL.DD5.1.H.264-FGT.mkv");
        assert_eq!(tokens, set(&["mean", "girls", "2004"]));

        let tokens = normalize("Heat 1995 2160p UHD BluRay x265 10bit HDR 25000kbps.mkv");
        assert_eq!(tokens, set(&["heat", "1995"]));
    }

    #[test]
    fn hyphenated_titles_survive_without_release_markers() {
        assert_eq!(normalize("Spider-Man.mkv"), set(&["spider", "man"]));
        assert_eq!(
            normalize("Spider-Man.2002.1080p.BluRay.x264-GROUP.mkv"),
            set(&["spider", "man", "2002"])
        );
    }

    #[test]
    fn drops_stop_words_and_non_year_annotations() {
        assert_eq!(
            normalize("The Lord of the Rings (Extended Edition) (2001)"),
            set(&["lord", "of", "rings", "2001"])
        );
    }

    #[test]
    fn keeps_dots_that_are_not_extensions() {
        assert_eq!(normalize("Mr. Robot"), set(&["mr", "robot"]));
    }

    #[test]
    fn removes_episode_markers() {
        assert_eq!(
            normalize("The.Office.S02E03.The.Dundies.720p.HDTV.mkv"),
            set(&["office", "dundies"])
        );
        assert_eq!(normalize("Office 2x03 Dundies.avi"), set(&["office", "dundies"]));
    }

    #[test]
    fn normalization_is_stable() {
        let name = "Blade.Runner.2049.2017.2160p.UHD.BluRay.REMUX.HDR.HEVC.Atmos-EPSiLON.mkv";
        assert_eq!(normalize(name), normalize(name));
    }

    #[test]
    fn jaccard_of_disjoint_and_empty_sets() {
        assert_eq!(jaccard(&set(&["a1"]), &set(&["b2"])), 0.0);
        assert_eq!(jaccard(&TokenSet::new(), &TokenSet::new()), 0.0);
        assert!((jaccard(&set(&["x", "y"]), &set(&["x"])) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn parses_episode_conventions() {
        let n = parse_episode(Path::new("Show/Show.S01E02.mkv")).unwrap();
        assert_eq!((n.season, n.episode), (1, 2));

        let n = parse_episode(Path::new("Show/Show 3x07.mkv")).unwrap();
        assert_eq!((n.season, n.episode), (3, 7));

        let n = parse_episode(Path::new("Show/Season 4/Episode 11.mkv")).unwrap();
        assert_eq!((n.season, n.episode), (4, 11));

        assert!(parse_episode(Path::new("Movies/Heat (1995).mkv")).is_none());
    }

    #[test]
    fn classifies_media_kind_from_path() {
        assert_eq!(
            classify_kind(Path::new("tv/Show/Show.S01E01.mkv")),
            MediaKind::Episode
        );
        assert_eq!(
            classify_kind(Path::new("Heat.1995.1080p.mkv")),
            MediaKind::Movie
        );
        assert_eq!(
            classify_kind(Path::new("Movies/Heat/heat.mkv")),
            MediaKind::Movie
        );
        assert_eq!(classify_kind(Path::new("misc/clip.mkv")), MediaKind::Unknown);
    }

    #[test]
    fn show_tokens_from_name_or_directory() {
        assert_eq!(
            show_tokens(Path::new("The.Office.S01E01.mkv")),
            set(&["office"])
        );
        let nested = PathBuf::from("Breaking Bad/Season 2/Episode 3.mkv");
        assert_eq!(show_tokens(&nested), set(&["breaking", "bad"]));
    }
}
