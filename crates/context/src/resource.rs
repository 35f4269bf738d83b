//! Fetching linked pages and attachments.

use std::time::Duration;

use {async_trait::async_trait, futures::StreamExt, tracing::debug, url::Url};

use crate::error::{Context, Error, Result};

/// Text bodies larger than this are treated as absent.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Image bodies larger than this are treated as absent.
const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Source of external content referenced by a message.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Return the text at `url`, or `None` when it is not text.
    async fn fetch_text(&self, url: &str) -> Result<Option<String>>;

    /// Return the raw body at `url` (image attachments), or `None` when it
    /// is too large.
    async fn fetch_bytes(&self, url: &str) -> Result<Option<Vec<u8>>>;
}

/// HTTP(S) fetcher: HTML is reduced to plain text, other `text/*` and JSON
/// bodies are returned as-is, anything else is absent.
pub struct HttpResourceFetcher {
    client: reqwest::Client,
}

impl HttpResourceFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tether/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::external("building http client", e))?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let parsed = Url::parse(url).with_context(|| format!("invalid url {url}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::unavailable(format!(
                "unsupported scheme: {}",
                parsed.scheme()
            )));
        }

        self.client
            .get(parsed)
            .send()
            .await
            .map_err(|e| Error::external(format!("GET {url}"), e))?
            .error_for_status()
            .map_err(|e| Error::external(format!("GET {url}"), e))
    }
}

/// Read at most `cap` bytes of `resp`; `None` once the body outgrows it.
///
/// `Content-Length` is only a hint: chunked bodies carry none, so the cap is
/// enforced while streaming.
async fn read_capped(resp: reqwest::Response, url: &str, cap: usize) -> Result<Option<Vec<u8>>> {
    if resp
        .content_length()
        .is_some_and(|len| usize::try_from(len).map_or(true, |len| len > cap))
    {
        debug!(url, "resource too large, skipping");
        return Ok(None);
    }

    let mut body = Vec::new();
    let mut chunks = resp.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| Error::external(format!("reading {url}"), e))?;
        if body.len() + chunk.len() > cap {
            debug!(url, read = body.len(), "resource too large, stopped reading");
            return Ok(None);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Some(body))
}

#[async_trait]
impl ResourceFetcher for HttpResourceFetcher {
    async fn fetch_text(&self, url: &str) -> Result<Option<String>> {
        let resp = self.get(url).await?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let kind = if content_type.contains("html") {
            BodyKind::Html
        } else if content_type.starts_with("text/") || content_type.contains("json") {
            BodyKind::Text
        } else {
            debug!(url, content_type, "non-text resource, skipping");
            return Ok(None);
        };

        let Some(bytes) = read_capped(resp, url, MAX_BODY_BYTES).await? else {
            return Ok(None);
        };
        let body = String::from_utf8_lossy(&bytes);
        Ok(Some(match kind {
            BodyKind::Html => html_to_text(&body),
            BodyKind::Text => body.into_owned(),
        }))
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let resp = self.get(url).await?;
        read_capped(resp, url, MAX_IMAGE_BYTES).await
    }
}

enum BodyKind {
    Html,
    Text,
}

// ── HTML reduction ──────────────────────────────────────────────────────────

/// Elements whose content is never visible text.
const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "head"];

/// Elements that start a new line.
const BLOCK_ELEMENTS: &[&str] = &[
    "br", "p", "div", "li", "tr", "h1", "h2", "h3", "h4", "h5", "h6", "section", "article",
    "header", "footer", "blockquote", "pre", "table", "ul", "ol",
];

/// Reduce an HTML document to readable text: tags dropped, hidden elements
/// skipped, common entities decoded, whitespace collapsed.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;
    let mut hidden: Option<String> = None;

    while let Some(lt) = rest.find('<') {
        if hidden.is_none() {
            push_text(&mut out, &rest[..lt]);
        }
        let after = &rest[lt + 1..];
        let Some(gt) = after.find('>') else {
            break;
        };
        let tag = &after[..gt];
        rest = &after[gt + 1..];

        let closing = tag.starts_with('/');
        let name: String = tag
            .trim_start_matches('/')
            .chars()
            .take_while(char::is_ascii_alphanumeric)
            .collect::<String>()
            .to_ascii_lowercase();

        if let Some(open) = &hidden {
            if closing && *open == name {
                hidden = None;
            }
            continue;
        }
        if !closing && !tag.ends_with('/') && HIDDEN_ELEMENTS.contains(&name.as_str()) {
            hidden = Some(name);
        } else if BLOCK_ELEMENTS.contains(&name.as_str()) {
            let trimmed = out.trim_end_matches(' ').len();
            out.truncate(trimmed);
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
        }
    }
    if hidden.is_none() && !rest.contains('<') {
        push_text(&mut out, rest);
    }

    out.trim().to_string()
}

/// Append decoded text, collapsing runs of whitespace to one space.
fn push_text(out: &mut String, raw: &str) {
    for ch in decode_entities(raw).chars() {
        if ch.is_whitespace() {
            if !out.is_empty() && !out.ends_with([' ', '\n']) {
                out.push(' ');
            }
        } else {
            out.push(ch);
        }
    }
}

fn decode_entities(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let candidate = &rest[amp..];
        let decoded = candidate
            .find(';')
            .filter(|&semi| semi <= 10)
            .and_then(|semi| decode_entity(&candidate[1..semi]).map(|ch| (ch, semi)));
        match decoded {
            Some((ch, semi)) => {
                out.push(ch);
                rest = &candidate[semi + 1..];
            },
            None => {
                out.push('&');
                rest = &candidate[1..];
            },
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            let code = name.strip_prefix('#')?;
            let value = match code.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => code.parse().ok()?,
            };
            char::from_u32(value)
        },
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        axum::{Router, routing::get},
        rstest::rstest,
    };

    #[rstest]
    #[case("<p>Hello <b>world</b></p>", "Hello world")]
    #[case("<p>one</p><p>two</p>", "one\ntwo")]
    #[case("a<br>b", "a\nb")]
    #[case("<script>var x = '<p>';</script>visible", "visible")]
    #[case("<style>p { color: red }</style><div>styled</div>", "styled")]
    #[case("Fish &amp; chips &lt;3 &#x1F600; &#233;", "Fish & chips <3 😀 é")]
    #[case("spaced   \n\t  out", "spaced out")]
    #[case("caf\u{e9} <i>na\u{ef}ve</i>", "caf\u{e9} na\u{ef}ve")]
    #[case("AT&T rocks", "AT&T rocks")]
    fn reduces_html(#[case] html: &str, #[case] expected: &str) {
        assert_eq!(html_to_text(html), expected);
    }

    async fn serve(content_type: &'static str, body: &'static str) -> String {
        let app = Router::new().route(
            "/page",
            get(move || async move { ([("content-type", content_type)], body) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/page")
    }

    fn fetcher() -> HttpResourceFetcher {
        HttpResourceFetcher::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn fetches_html_as_text() {
        let url = serve("text/html; charset=utf-8", "<h1>Title</h1><p>Body</p>").await;
        let text = fetcher().fetch_text(&url).await.unwrap();
        assert_eq!(text.as_deref(), Some("Title\nBody"));
    }

    #[tokio::test]
    async fn fetches_plain_text_verbatim() {
        let url = serve("text/plain", "line one\nline two").await;
        let text = fetcher().fetch_text(&url).await.unwrap();
        assert_eq!(text.as_deref(), Some("line one\nline two"));
    }

    #[tokio::test]
    async fn binary_bodies_are_absent() {
        let url = serve("application/octet-stream", "\u{0}\u{1}").await;
        assert_eq!(fetcher().fetch_text(&url).await.unwrap(), None);
    }

    #[tokio::test]
    async fn chunked_oversized_body_is_absent() {
        let app = Router::new().route(
            "/big",
            get(|| async {
                let chunk = vec![b'a'; 512 * 1024];
                let body = futures::stream::iter(
                    (0..8).map(move |_| Ok::<_, std::convert::Infallible>(chunk.clone())),
                );
                (
                    [("content-type", "text/plain")],
                    axum::body::Body::from_stream(body),
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let text = fetcher()
            .fetch_text(&format!("http://{addr}/big"))
            .await
            .unwrap();
        assert_eq!(text, None);
    }

    #[tokio::test]
    async fn fetches_image_bytes() {
        let url = serve("image/png", "\u{89}PNG").await;
        let bytes = fetcher().fetch_bytes(&url).await.unwrap();
        assert_eq!(bytes.as_deref(), Some("\u{89}PNG".as_bytes()));
    }

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        assert!(fetcher().fetch_text("file:///etc/passwd").await.is_err());
        assert!(fetcher().fetch_text("not a url").await.is_err());
        assert!(fetcher().fetch_bytes("file:///etc/passwd").await.is_err());
    }
}
