use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

static DUMP_GRADIENT: OnceLock<Option<PathBuf>> = OnceLock::new();
static FORCE_RECOMPUTE: OnceLock<Option<bool>> = OnceLock::new();
static PASS_MAX_ITERS: OnceLock<Option<usize>> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Path the gradient model is written to after `build()`.
pub(crate) fn dump_gradient_path() -> Option<PathBuf> {
    DUMP_GRADIENT
        .get_or_init(|| match env::var("GRADSPLIT_DUMP_GRADIENT") {
            Ok(value) if !value.trim().is_empty() => Some(PathBuf::from(value.trim())),
            _ => None,
        })
        .clone()
}

/// `GRADSPLIT_RECOMPUTE` overrides `BuildConfig::enable_recompute` when set.
pub(crate) fn recompute_override() -> Option<bool> {
    *FORCE_RECOMPUTE.get_or_init(|| match env::var("GRADSPLIT_RECOMPUTE") {
        Ok(value) if !value.trim().is_empty() => Some(parse_bool(&value)),
        _ => None,
    })
}

/// Upper bound for fixed-point pass groups in the default pipeline.
pub(crate) fn pass_max_iters() -> Option<usize> {
    *PASS_MAX_ITERS.get_or_init(|| match env::var("GRADSPLIT_PASS_MAX_ITERS") {
        Ok(value) => value.trim().parse::<usize>().ok().filter(|n| *n > 0),
        Err(_) => None,
    })
}
