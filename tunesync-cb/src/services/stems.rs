//! Stem asset normalization
//!
//! The provider reports separation results in whichever shape its
//! endpoint happens to produce: a flat object of `{type}Url` keys, or an
//! array of `{type, url}` objects. Nothing declares the shape up front,
//! so extraction is heuristic: normalize keys, keep only recognized
//! stem aliases, drop everything else silently for forward
//! compatibility. All functions here are pure and total: malformed
//! input yields an empty list, never an error.
//!
//! Extracted text is untrusted third-party echo and is sanitized before
//! persistence.

use serde_json::Value;

/// Multi-stem separation (vocals, drums, bass, ...).
pub const MODE_SPLIT_STEM: &str = "split_stem";
/// Two-way vocal/instrumental separation.
pub const MODE_SEPARATE_VOCAL: &str = "separate_vocal";

/// One normalized stem asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StemAsset {
    /// Canonical stem type ("vocals", "drums", ...)
    pub stem_type: String,
    pub audio_url: String,
    /// Provider key the asset came from, for provenance
    pub source_key: String,
}

/// Lowercase-alphanumeric normalization: `Backing_Vocals-URL` and
/// `backingVocalsUrl` both become `backingvocalsurl`.
fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Map a provider key to a canonical stem type.
///
/// Keys must end in `url`; `stream`/`source` keys are transient
/// previews, not separation outputs. Unrecognized keys resolve to
/// `None` and are dropped by the caller.
pub fn resolve_stem_type(key: &str) -> Option<&'static str> {
    let normalized = normalize_key(key);

    if !normalized.ends_with("url") {
        return None;
    }
    if normalized.contains("stream") || normalized.contains("source") {
        return None;
    }

    // Explicit alias table; every known payload shape is covered by a row
    let stem_type = match normalized.as_str() {
        "vocalurl" | "vocalsurl" => "vocals",
        "backingvocalsurl" | "backingvocalurl" => "backing_vocals",
        "originurl" | "originalurl" => "original",
        "instrumentalurl" | "instrumenturl" => "instrumental",
        "drumurl" | "drumsurl" => "drums",
        "bassurl" => "bass",
        "guitarurl" => "guitar",
        "pianourl" => "piano",
        "keyboardurl" | "keysurl" => "keyboard",
        "stringsurl" | "stringurl" => "strings",
        "synthurl" => "synth",
        "brassurl" => "brass",
        "woodwindsurl" | "woodwindurl" => "woodwinds",
        "percussionurl" => "percussion",
        "fxurl" | "effectsurl" => "fx",
        "otherurl" => "other",
        _ => return None,
    };
    Some(stem_type)
}

/// Extract `{stem_type, audio_url, source_key}` triples from a provider
/// payload of either supported shape. Pure and total.
pub fn extract_assets(payload: &Value) -> Vec<StemAsset> {
    match payload {
        Value::Object(map) => map
            .iter()
            .filter_map(|(key, value)| {
                let url = value.as_str()?;
                asset_from(key, url)
            })
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let obj = item.as_object()?;
                let stem_type = obj
                    .get("type")
                    .or_else(|| obj.get("instrument"))
                    .and_then(Value::as_str)?;
                let url = obj
                    .get("url")
                    .or_else(|| obj.get("audio_url"))
                    .and_then(Value::as_str)?;
                // Run array entries through the same alias table by
                // treating the declared type as a `<type>Url` key
                asset_from_typed(stem_type, &format!("{stem_type}Url"), url)
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn asset_from(source_key: &str, url: &str) -> Option<StemAsset> {
    let stem_type = resolve_stem_type(source_key)?;
    let audio_url = sanitize_stem_text(url, 2048);
    if audio_url.is_empty() {
        return None;
    }
    Some(StemAsset {
        stem_type: stem_type.to_string(),
        audio_url,
        source_key: source_key.to_string(),
    })
}

fn asset_from_typed(declared_type: &str, synthetic_key: &str, url: &str) -> Option<StemAsset> {
    let stem_type = resolve_stem_type(synthetic_key)?;
    let audio_url = sanitize_stem_text(url, 2048);
    if audio_url.is_empty() {
        return None;
    }
    Some(StemAsset {
        stem_type: stem_type.to_string(),
        audio_url,
        source_key: declared_type.to_string(),
    })
}

/// Pick the separation mode for a reconciled asset set. A
/// caller-declared mode wins; otherwise more than two assets implies a
/// multi-stem split.
pub fn determine_separation_mode(requested: Option<&str>, asset_count: usize) -> &str {
    match requested.map(str::trim).filter(|s| !s.is_empty()) {
        Some(MODE_SPLIT_STEM) => MODE_SPLIT_STEM,
        Some(MODE_SEPARATE_VOCAL) => MODE_SEPARATE_VOCAL,
        // Unknown declared modes fall through to the count heuristic
        _ if asset_count > 2 => MODE_SPLIT_STEM,
        _ => MODE_SEPARATE_VOCAL,
    }
}

/// Strip script/iframe tags and `javascript:` URLs from provider echo,
/// then cap the length. Removal loops until no pattern remains so
/// split-and-recombine tricks ("java<script>script:") don't survive.
pub fn sanitize_stem_text(input: &str, max_len: usize) -> String {
    let mut text = input.trim().to_string();

    const PATTERNS: [&str; 5] = ["<script", "</script>", "<iframe", "</iframe>", "javascript:"];
    loop {
        let mut changed = false;
        for pattern in PATTERNS {
            while let Some(pos) = text.to_ascii_lowercase().find(pattern) {
                text.replace_range(pos..pos + pattern.len(), "");
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    if text.chars().count() > max_len {
        text = text.chars().take(max_len).collect();
    }
    text
}
