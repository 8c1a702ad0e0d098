//! Anti-automation signature detection.
//!
//! Scans page content for known vendor signatures and summarises the markup
//! signals (script, iframe and form counts) the rule engine and the local
//! classifier consume. Detection is pure and never performs I/O.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use std::fmt;

/// Named anti-automation protections recognised by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protection {
    Cloudflare,
    Datadome,
    Recaptcha,
    Hcaptcha,
    PerimeterX,
}

impl Protection {
    pub fn as_str(self) -> &'static str {
        match self {
            Protection::Cloudflare => "cloudflare",
            Protection::Datadome => "datadome",
            Protection::Recaptcha => "recaptcha",
            Protection::Hcaptcha => "hcaptcha",
            Protection::PerimeterX => "perimeterx",
        }
    }

    pub fn is_captcha(self) -> bool {
        matches!(self, Protection::Recaptcha | Protection::Hcaptcha)
    }

    /// Mitigation tactics implied by this protection, in preference order.
    pub fn bypass_strategies(self) -> &'static [&'static str] {
        match self {
            Protection::Cloudflare => &["stealth_mode", "rotate_user_agent", "residential_proxy"],
            Protection::Recaptcha | Protection::Hcaptcha => &["captcha_solver", "behavioral_mimicry"],
            Protection::Datadome => &["ja3_randomization", "canvas_fingerprint_random"],
            Protection::PerimeterX => &["behavioral_mimicry", "residential_proxy"],
        }
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered, deduplicated bypass plan for a set of protections.
///
/// Falls back to `standard_headers` when nothing was detected.
pub fn bypass_plan(protections: &[Protection]) -> Vec<String> {
    let mut plan: Vec<String> = Vec::new();
    for strategy in protections.iter().flat_map(|p| p.bypass_strategies()) {
        if !plan.iter().any(|existing| existing == strategy) {
            plan.push((*strategy).to_string());
        }
    }
    if plan.is_empty() {
        plan.push("standard_headers".to_string());
    }
    plan
}

#[derive(Debug)]
struct ProtectionSignature {
    protection: Protection,
    patterns: Vec<Regex>,
}

impl ProtectionSignature {
    fn new(protection: Protection, raw_patterns: &[&str]) -> Self {
        Self {
            protection,
            patterns: raw_patterns.iter().map(|p| build_regex(p)).collect(),
        }
    }

    fn matches(&self, body: &str) -> bool {
        self.patterns.iter().any(|regex| regex.is_match(body))
    }
}

static SIGNATURES: Lazy<Vec<ProtectionSignature>> = Lazy::new(|| {
    vec![
        ProtectionSignature::new(
            Protection::Cloudflare,
            &[r"cloudflare", r"cf-ray", r"__cf_bm", r"/cdn-cgi/challenge-platform/"],
        ),
        ProtectionSignature::new(
            Protection::Datadome,
            &[r"datadome", r"captcha-delivery\.com"],
        ),
        ProtectionSignature::new(Protection::Recaptcha, &[r"recaptcha", r"g-recaptcha"]),
        ProtectionSignature::new(Protection::Hcaptcha, &[r"hcaptcha", r"h-captcha"]),
        ProtectionSignature::new(
            Protection::PerimeterX,
            &[r"perimeterx", r"px-captcha", r"_pxhd", r"_pxvid"],
        ),
    ]
});

static SCRIPT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("script").expect("invalid script selector"));
static IFRAME_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("iframe").expect("invalid iframe selector"));
static FORM_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("form").expect("invalid form selector"));

/// Markup summary of one page, computed once per request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageProfile {
    pub length: usize,
    pub script_count: usize,
    pub iframe_count: usize,
    pub form_count: usize,
    pub protections: Vec<Protection>,
    pub cloudflare_mentions: usize,
    pub captcha_mentions: usize,
}

impl PageProfile {
    pub fn is_protected(&self) -> bool {
        !self.protections.is_empty()
    }

    pub fn has(&self, protection: Protection) -> bool {
        self.protections.contains(&protection)
    }

    pub fn has_captcha(&self) -> bool {
        self.protections.iter().any(|p| p.is_captcha())
    }

    pub fn protection_names(&self) -> Vec<String> {
        self.protections.iter().map(|p| p.as_str().to_string()).collect()
    }
}

/// Signature-based protection detector.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtectionDetector;

impl ProtectionDetector {
    pub fn new() -> Self {
        Self
    }

    /// Protections whose signatures appear in the body.
    pub fn detect(&self, html: &str) -> Vec<Protection> {
        SIGNATURES
            .iter()
            .filter(|signature| signature.matches(html))
            .map(|signature| signature.protection)
            .collect()
    }

    /// Full markup profile for the page.
    pub fn profile(&self, html: &str) -> PageProfile {
        let document = Html::parse_document(html);
        let lowered = html.to_lowercase();

        PageProfile {
            length: html.len(),
            script_count: document.select(&SCRIPT_SELECTOR).count(),
            iframe_count: document.select(&IFRAME_SELECTOR).count(),
            form_count: document.select(&FORM_SELECTOR).count(),
            protections: self.detect(html),
            cloudflare_mentions: lowered.matches("cloudflare").count(),
            captcha_mentions: lowered.matches("captcha").count(),
        }
    }
}

fn build_regex(pattern: &str) -> Regex {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid protection signature regex `{}`: {}", pattern, err))
}
