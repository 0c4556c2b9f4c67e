/// What a freshly loaded page appears to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageVerdict {
    /// Regular content.
    Clear,
    /// Interstitial verification that may resolve on its own or with interaction.
    Challenge,
    /// Hard block or CAPTCHA; waiting will not help.
    Blocked,
    /// Nothing to judge (empty document).
    Unknown,
}

const CHALLENGE_TITLES: &[&str] = &[
    "just a moment",
    "attention required",
    "checking your browser",
    "please wait",
    "verifying you are human",
    "one more step",
    "ddos-guard",
];

const CHALLENGE_CONTENT: &[&str] = &[
    "cf-challenge",
    "challenge-platform",
    "cf-browser-verification",
    "cf_chl_opt",
    "checking if the site connection is secure",
    "needs to review the security of your connection",
    "_incapsula_resource",
    "px-captcha-wrapper",
];

const BLOCK_TITLES: &[&str] = &[
    "access denied",
    "robot check",
    "403 forbidden",
    "429 too many requests",
    "request blocked",
];

const BLOCK_CONTENT: &[&str] = &[
    "g-recaptcha",
    "h-captcha",
    "captcha-form",
    "unusual traffic",
    "systems have detected",
    "enter the characters you see below",
    "request unsuccessful. incapsula",
    "you have been blocked",
    "access to this page has been denied",
];

/// Classify a page from its title and markup. Challenge markers win over
/// block markers, since challenge pages frequently embed CAPTCHA widgets as a
/// fallback.
pub fn classify(title: &str, content: &str) -> PageVerdict {
    let title = title.trim().to_lowercase();
    let content = content.to_lowercase();

    if title.is_empty() && content.trim().is_empty() {
        return PageVerdict::Unknown;
    }

    if CHALLENGE_TITLES.iter().any(|m| title.contains(m))
        || CHALLENGE_CONTENT.iter().any(|m| content.contains(m))
    {
        return PageVerdict::Challenge;
    }

    if BLOCK_TITLES.iter().any(|m| title.contains(m))
        || BLOCK_CONTENT.iter().any(|m| content.contains(m))
    {
        return PageVerdict::Blocked;
    }

    PageVerdict::Clear
}

/// True while the title still looks like an interstitial.
pub fn title_is_challenge(title: &str) -> bool {
    let title = title.trim().to_lowercase();
    CHALLENGE_TITLES.iter().any(|m| title.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloudflare_interstitial_is_a_challenge() {
        let verdict = classify(
            "Just a moment...",
            "<div id=\"challenge-platform\"></div><div class=\"g-recaptcha\"></div>",
        );
        assert_eq!(verdict, PageVerdict::Challenge);
    }

    #[test]
    fn captcha_wall_is_blocked() {
        assert_eq!(
            classify(
                "Amazon.com",
                "<form action=\"/errors/validateCaptcha\">Enter the characters you see below</form>"
            ),
            PageVerdict::Blocked
        );
        assert_eq!(classify("Access Denied", "<h1>nope</h1>"), PageVerdict::Blocked);
    }

    #[test]
    fn ordinary_pages_are_clear() {
        assert_eq!(
            classify("Desk lamps | Shop", "<div class=\"product\">Lamp</div>"),
            PageVerdict::Clear
        );
    }

    #[test]
    fn empty_document_is_unknown() {
        assert_eq!(classify("  ", "\n"), PageVerdict::Unknown);
    }
}
