//! Normalizing one raw message into a [`Node`].

use std::{
    collections::BTreeSet,
    sync::{Arc, LazyLock},
};

use {
    base64::{Engine, engine::general_purpose::STANDARD as BASE64},
    regex::Regex,
    tether_config::LimitsConfig,
    tracing::debug,
};

use crate::{
    node::{ImageRef, Node, RawMessage, Warning},
    resource::ResourceFetcher,
};

static LINK_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"'`()\[\]]+"#).ok());

/// Running character budget shared by every text part of one message.
struct TextBudget {
    text: String,
    remaining: usize,
    truncated: bool,
}

impl TextBudget {
    fn new(max_chars: usize) -> Self {
        Self {
            text: String::new(),
            remaining: max_chars,
            truncated: false,
        }
    }

    fn exhausted(&self) -> bool {
        self.truncated || self.remaining == 0
    }

    /// Append `part` on a new line, cutting it to what is left of the budget.
    fn push(&mut self, part: &str) {
        let part = part.trim();
        if part.is_empty() {
            return;
        }
        if self.exhausted() {
            self.truncated = true;
            return;
        }

        let separator = usize::from(!self.text.is_empty());
        let len = part.chars().count();
        if separator + len <= self.remaining {
            if separator == 1 {
                self.text.push('\n');
            }
            self.text.push_str(part);
            self.remaining -= separator + len;
            return;
        }

        self.truncated = true;
        if self.remaining > separator {
            if separator == 1 {
                self.text.push('\n');
            }
            let keep = self.remaining - separator;
            self.text.extend(part.chars().take(keep));
        }
        self.remaining = 0;
    }
}

/// Keep at most `max_words` whitespace-separated words.
fn cap_words(text: &str, max_words: usize) -> String {
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Distinct links in order of appearance.
fn find_links(text: &str, max: usize) -> Vec<&str> {
    let mut links: Vec<&str> = Vec::new();
    let Some(re) = LINK_RE.as_ref() else {
        return links;
    };
    if max == 0 {
        return links;
    }
    for m in re.find_iter(text) {
        let link = m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']);
        if !links.contains(&link) {
            links.push(link);
        }
        if links.len() == max {
            break;
        }
    }
    links
}

/// Turns raw messages into nodes: body, text attachments and linked pages
/// share one character budget; images are kept up to the limit.
#[derive(Clone)]
pub struct ContentExtractor {
    fetcher: Arc<dyn ResourceFetcher>,
}

impl ContentExtractor {
    pub fn new(fetcher: Arc<dyn ResourceFetcher>) -> Self {
        Self { fetcher }
    }

    async fn fetch_text(&self, url: &str) -> Option<String> {
        match self.fetcher.fetch_text(url).await {
            Ok(text) => text,
            Err(e) => {
                debug!(url, error = %e, "resource fetch failed, treating as absent");
                None
            },
        }
    }

    /// Download an image attachment and inline it as a `data:` URL, so the
    /// backend never has to reach the platform's (expiring) CDN link.
    async fn fetch_image(&self, url: &str, media_type: &str) -> Option<String> {
        match self.fetcher.fetch_bytes(url).await {
            Ok(Some(bytes)) => Some(format!("data:{media_type};base64,{}", BASE64.encode(bytes))),
            Ok(None) => None,
            Err(e) => {
                debug!(url, error = %e, "image download failed, treating as absent");
                None
            },
        }
    }

    /// Build the node for `raw`. `vision` says whether the active model can
    /// consume images at all.
    pub async fn extract(&self, raw: &RawMessage, limits: &LimitsConfig, vision: bool) -> Node {
        let mut warnings = BTreeSet::new();
        let mut budget = TextBudget::new(limits.max_text);
        budget.push(&raw.text);

        let mut images = Vec::new();
        let mut images_dropped = false;
        let mut unsupported = false;

        for att in &raw.attachments {
            if att.is_text() {
                if budget.exhausted() {
                    budget.truncated = true;
                    continue;
                }
                if let Some(text) = self.fetch_text(&att.url).await {
                    budget.push(&text);
                }
            } else if att.is_image() {
                if vision && images.len() < limits.max_images {
                    let media_type = att.media_type();
                    if let Some(url) = self.fetch_image(&att.url, media_type).await {
                        images.push(ImageRef {
                            url,
                            media_type: media_type.to_string(),
                            usable: vision,
                        });
                    }
                } else {
                    images_dropped = true;
                }
            } else {
                unsupported = true;
            }
        }

        for link in find_links(&raw.text, limits.max_links) {
            if budget.exhausted() {
                break;
            }
            if let Some(page) = self.fetch_text(link).await {
                budget.push(&cap_words(&page, limits.max_link_words));
            }
        }

        if budget.truncated {
            warnings.insert(Warning::TextLimit);
        }
        if images_dropped {
            warnings.insert(Warning::ImageLimit);
        }
        if unsupported {
            warnings.insert(Warning::UnsupportedAttachments);
        }

        Node {
            id: raw.id.clone(),
            channel_id: raw.channel_id.clone(),
            author_id: raw.author_id.clone(),
            is_self: raw.is_self,
            text: budget.text,
            images,
            parent: raw.parent.clone(),
            created_at: raw.created_at,
            truncated: budget.truncated || images_dropped,
            unsupported_attachments: unsupported,
            warnings,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::HashMap,
        sync::Mutex,
    };

    use {
        super::*,
        crate::{error::Error, node::RawAttachment},
        async_trait::async_trait,
        chrono::Utc,
        rstest::rstest,
    };

    /// In-memory fetcher serving the same bodies as text and bytes; unknown
    /// urls fail.
    #[derive(Default)]
    pub(crate) struct FakeFetcher {
        pub pages: HashMap<String, String>,
        pub requested: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        pub fn with(pages: &[(&str, &str)]) -> Self {
            Self {
                pages: pages
                    .iter()
                    .map(|(u, t)| (u.to_string(), t.to_string()))
                    .collect(),
                requested: Mutex::default(),
            }
        }
    }

    #[async_trait]
    impl ResourceFetcher for FakeFetcher {
        async fn fetch_text(&self, url: &str) -> crate::error::Result<Option<String>> {
            self.requested.lock().unwrap().push(url.to_string());
            self.pages
                .get(url)
                .cloned()
                .map(Some)
                .ok_or_else(|| Error::not_found(url))
        }

        async fn fetch_bytes(&self, url: &str) -> crate::error::Result<Option<Vec<u8>>> {
            self.fetch_text(url).await.map(|body| body.map(String::into_bytes))
        }
    }

    pub(crate) fn raw(id: &str, text: &str) -> RawMessage {
        RawMessage {
            id: id.into(),
            channel_id: "chan".into(),
            author_id: "alice".into(),
            is_self: false,
            text: text.into(),
            attachments: Vec::new(),
            parent: None,
            created_at: Utc::now(),
        }
    }

    fn attachment(url: &str, mime: &str) -> RawAttachment {
        RawAttachment {
            url: url.into(),
            filename: url.rsplit('/').next().unwrap_or_default().into(),
            content_type: Some(mime.into()),
        }
    }

    fn extractor(fetcher: FakeFetcher) -> (ContentExtractor, Arc<FakeFetcher>) {
        let fetcher = Arc::new(fetcher);
        (ContentExtractor::new(fetcher.clone()), fetcher)
    }

    #[tokio::test]
    async fn plain_text_passes_through() {
        let (ex, _) = extractor(FakeFetcher::default());
        let node = ex
            .extract(&raw("1", "hello there"), &LimitsConfig::default(), true)
            .await;
        assert_eq!(node.text, "hello there");
        assert!(!node.truncated);
        assert!(node.warnings.is_empty());
    }

    #[tokio::test]
    async fn text_is_truncated_to_budget() {
        let (ex, _) = extractor(FakeFetcher::default());
        let limits = LimitsConfig {
            max_text: 5,
            ..Default::default()
        };
        let node = ex.extract(&raw("1", "ünïcödé text"), &limits, true).await;
        assert_eq!(node.text, "ünïcö");
        assert!(node.truncated);
        assert!(node.warnings.contains(&Warning::TextLimit));
    }

    #[tokio::test]
    async fn text_attachments_share_budget_in_order() {
        let (ex, _) = extractor(FakeFetcher::with(&[
            ("https://cdn/a.txt", "alpha"),
            ("https://cdn/b.txt", "bravo charlie"),
        ]));
        let mut msg = raw("1", "body");
        msg.attachments = vec![
            attachment("https://cdn/a.txt", "text/plain"),
            attachment("https://cdn/b.txt", "text/plain; charset=utf-8"),
        ];
        let limits = LimitsConfig {
            max_text: 16,
            ..Default::default()
        };
        let node = ex.extract(&msg, &limits, true).await;
        assert_eq!(node.text, "body\nalpha\nbravo");
        assert_eq!(node.text.chars().count(), 16);
        assert!(node.truncated);
    }

    #[tokio::test]
    async fn failed_attachment_download_is_absent() {
        let (ex, _) = extractor(FakeFetcher::default());
        let mut msg = raw("1", "body");
        msg.attachments = vec![attachment("https://cdn/missing.txt", "text/plain")];
        let node = ex.extract(&msg, &LimitsConfig::default(), true).await;
        assert_eq!(node.text, "body");
        assert!(node.warnings.is_empty());
    }

    #[tokio::test]
    async fn images_are_capped() {
        let (ex, fetcher) = extractor(FakeFetcher::with(&[
            ("https://cdn/0.png", "PNG"),
            ("https://cdn/1.png", "PNG"),
            ("https://cdn/2.png", "PNG"),
            ("https://cdn/3.png", "PNG"),
        ]));
        let mut msg = raw("1", "pics");
        msg.attachments = (0..4)
            .map(|i| attachment(&format!("https://cdn/{i}.png"), "image/png"))
            .collect();
        let limits = LimitsConfig {
            max_images: 2,
            ..Default::default()
        };
        let node = ex.extract(&msg, &limits, true).await;
        assert_eq!(node.images.len(), 2);
        assert!(node.images.iter().all(|img| img.usable));
        assert!(node.truncated);
        assert!(node.warnings.contains(&Warning::ImageLimit));
        // Only the kept images are downloaded.
        assert_eq!(fetcher.requested.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn images_are_inlined_as_data_urls() {
        let (ex, _) = extractor(FakeFetcher::with(&[("https://cdn/cat.png", "PNG")]));
        let mut msg = raw("1", "look");
        msg.attachments = vec![attachment("https://cdn/cat.png", "image/png; name=cat")];
        let node = ex.extract(&msg, &LimitsConfig::default(), true).await;
        assert_eq!(node.images, vec![ImageRef {
            url: "data:image/png;base64,UE5H".into(),
            media_type: "image/png".into(),
            usable: true,
        }]);
    }

    #[tokio::test]
    async fn failed_image_download_is_absent() {
        let (ex, _) = extractor(FakeFetcher::default());
        let mut msg = raw("1", "look");
        msg.attachments = vec![attachment("https://cdn/gone.png", "image/png")];
        let node = ex.extract(&msg, &LimitsConfig::default(), true).await;
        assert!(node.images.is_empty());
        assert!(node.warnings.is_empty());
    }

    #[tokio::test]
    async fn images_dropped_without_vision() {
        let (ex, _) = extractor(FakeFetcher::default());
        let mut msg = raw("1", "");
        msg.attachments = vec![attachment("https://cdn/cat.jpg", "image/jpeg")];
        let node = ex.extract(&msg, &LimitsConfig::default(), false).await;
        assert!(node.images.is_empty());
        assert!(node.warnings.contains(&Warning::ImageLimit));
    }

    #[tokio::test]
    async fn unsupported_attachments_are_flagged() {
        let (ex, fetcher) = extractor(FakeFetcher::default());
        let mut msg = raw("1", "see pdf");
        msg.attachments = vec![attachment("https://cdn/doc.pdf", "application/pdf")];
        let node = ex.extract(&msg, &LimitsConfig::default(), true).await;
        assert!(node.unsupported_attachments);
        assert!(!node.truncated);
        assert!(node.warnings.contains(&Warning::UnsupportedAttachments));
        assert!(fetcher.requested.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn linked_page_is_appended_with_word_cap() {
        let (ex, fetcher) = extractor(FakeFetcher::with(&[(
            "https://example.com/post",
            "one two three four five",
        )]));
        let limits = LimitsConfig {
            max_link_words: 3,
            ..Default::default()
        };
        let msg = raw(
            "1",
            "read https://example.com/post. and https://example.com/other",
        );
        let node = ex.extract(&msg, &limits, true).await;
        assert_eq!(
            node.text,
            "read https://example.com/post. and https://example.com/other\none two three"
        );
        // max_links = 1 by default
        assert_eq!(*fetcher.requested.lock().unwrap(), vec![
            "https://example.com/post".to_string()
        ]);
    }

    #[tokio::test]
    async fn exhausted_budget_skips_fetches() {
        let (ex, fetcher) = extractor(FakeFetcher::with(&[("https://example.com/", "page")]));
        let limits = LimitsConfig {
            max_text: 4,
            ..Default::default()
        };
        let node = ex
            .extract(&raw("1", "look https://example.com/"), &limits, true)
            .await;
        assert_eq!(node.text, "look");
        assert!(fetcher.requested.lock().unwrap().is_empty());
    }

    #[rstest]
    #[case("no links here", 1, vec![])]
    #[case("a https://x.io/a, b http://y.io/b", 5, vec!["https://x.io/a", "http://y.io/b"])]
    #[case("dup https://x.io https://x.io", 5, vec!["https://x.io"])]
    #[case("(https://x.io/p) <https://y.io>", 5, vec!["https://x.io/p", "https://y.io"])]
    #[case("https://a.io https://b.io", 1, vec!["https://a.io"])]
    #[case("https://a.io", 0, vec![])]
    fn link_detection(#[case] text: &str, #[case] max: usize, #[case] expected: Vec<&str>) {
        assert_eq!(find_links(text, max), expected);
    }

    #[test]
    fn never_exceeds_budget() {
        for max in 0..12 {
            let mut budget = TextBudget::new(max);
            for part in ["abc", "defgh", "ij", "klmnopq"] {
                budget.push(part);
            }
            assert!(budget.text.chars().count() <= max);
            assert_eq!(budget.truncated, max < 20);
        }
    }
}
