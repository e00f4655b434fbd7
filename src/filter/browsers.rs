//! Private-browsing window detection.
//!
//! Best-effort: browsers mark private windows in the title in
//! locale- and version-dependent ways, so this table is not exhaustive.

struct BrowserMarkers {
    /// Substrings of the lower-cased process identifier.
    process_ids: &'static [&'static str],
    /// Substrings of the window title that indicate a private window.
    title_markers: &'static [&'static str],
}

const BROWSERS: &[BrowserMarkers] = &[
    BrowserMarkers {
        process_ids: &["com.google.chrome", "chrome", "chromium"],
        title_markers: &["Incognito", "Inkognito", "Navigation privée"],
    },
    BrowserMarkers {
        process_ids: &["com.microsoft.edgemac", "msedge", "microsoft edge"],
        title_markers: &["InPrivate"],
    },
    BrowserMarkers {
        process_ids: &["org.mozilla.firefox", "firefox"],
        title_markers: &["Private Browsing", "Privater Modus", "Navigation privée"],
    },
    BrowserMarkers {
        process_ids: &["com.apple.safari", "safari"],
        title_markers: &["Private Browsing", "Private"],
    },
    BrowserMarkers {
        process_ids: &["com.brave.browser", "brave"],
        title_markers: &["Private", "Tor"],
    },
    BrowserMarkers {
        process_ids: &["com.operasoftware.opera", "opera"],
        title_markers: &["Private"],
    },
];

/// Markers that are specific enough to check even for unrecognised browsers.
const GENERIC_MARKERS: &[&str] = &["Incognito", "InPrivate", "Private Browsing"];

/// Whether the window looks like a private/incognito browsing session.
pub fn is_private_window(process_id: Option<&str>, window_title: Option<&str>) -> bool {
    let Some(title) = window_title else {
        return false;
    };

    let process = process_id.map(str::to_ascii_lowercase);
    let known = process.as_deref().and_then(|p| {
        BROWSERS
            .iter()
            .find(|b| b.process_ids.iter().any(|id| p.contains(id)))
    });

    match known {
        Some(browser) => browser.title_markers.iter().any(|m| title.contains(m)),
        None => GENERIC_MARKERS.iter().any(|m| title.contains(m)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chrome_incognito() {
        assert!(is_private_window(
            Some("com.google.Chrome"),
            Some("New Tab - Google Chrome (Incognito)")
        ));
        assert!(!is_private_window(
            Some("com.google.Chrome"),
            Some("Inbox - Google Chrome")
        ));
    }

    #[test]
    fn test_edge_inprivate() {
        assert!(is_private_window(
            Some("msedge.exe"),
            Some("Bing and 1 more page - [InPrivate] - Microsoft Edge")
        ));
    }

    #[test]
    fn test_firefox_private() {
        assert!(is_private_window(
            Some("firefox"),
            Some("Mozilla Firefox Private Browsing")
        ));
    }

    #[test]
    fn test_unknown_browser_uses_generic_markers() {
        assert!(is_private_window(Some("vivaldi"), Some("Tab (Incognito)")));
        // "Private" alone is too broad without knowing the browser.
        assert!(!is_private_window(Some("vivaldi"), Some("Private notes")));
    }

    #[test]
    fn test_missing_title_is_not_private() {
        assert!(!is_private_window(Some("chrome"), None));
    }
}
