//! Document acquisition.
//!
//! Turns an input source — a local text or PDF file, or an HTTP(S) URL — into
//! raw text for preprocessing. Web pages are reduced to their body text; PDF
//! bytes go through pdf-extract. This sits outside the mapping core, which
//! only ever sees plain text.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// A parsed input document, before cleaning.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    /// The source as given (path or URL).
    pub source: String,
    pub title: Option<String>,
    pub text: String,
}

/// Parse an input source into raw document text.
///
/// - `http(s)://...` URLs are fetched; a PDF content type (or `.pdf` path)
///   goes through PDF extraction, anything else is treated as HTML.
/// - Local `.pdf` files go through PDF extraction.
/// - Any other local file is read as UTF-8 text.
pub async fn parse_input(source: &str, timeout_secs: u64) -> Result<ParsedDocument> {
    if source.starts_with("http://") || source.starts_with("https://") {
        return fetch_url(source, timeout_secs).await;
    }

    let path = Path::new(source);
    if !path.exists() {
        bail!("Input not found: {}", source);
    }

    let is_pdf = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false);

    let text = if is_pdf {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        pdf_extract::extract_text_from_mem(&bytes)
            .map_err(|e| anyhow::anyhow!("PDF extraction failed for {}: {}", path.display(), e))?
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?
    };

    let title = path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string());

    Ok(ParsedDocument {
        source: source.to_string(),
        title,
        text,
    })
}

async fn fetch_url(url: &str, timeout_secs: u64) -> Result<ParsedDocument> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?;

    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to fetch {}", url))?;
    if !response.status().is_success() {
        bail!("Fetch failed for {}: HTTP {}", url, response.status());
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let is_pdf = content_type.contains("application/pdf")
        || url.split('?').next().unwrap_or(url).ends_with(".pdf");

    if is_pdf {
        let bytes = response.bytes().await?;
        let text = pdf_extract::extract_text_from_mem(&bytes)
            .map_err(|e| anyhow::anyhow!("PDF extraction failed for {}: {}", url, e))?;
        return Ok(ParsedDocument {
            source: url.to_string(),
            title: None,
            text,
        });
    }

    let html = response.text().await?;
    let title = extract_title(&html);

    Ok(ParsedDocument {
        source: url.to_string(),
        title,
        text: html,
    })
}

/// Pull the `<title>` text out of an HTML page, if present.
fn extract_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let open = lower.find("<title")?;
    let content_start = open + html[open..].find('>')? + 1;
    let content_end = content_start + lower[content_start..].find("</title")?;
    let title = crate::preprocess::clean_text(&html[content_start..content_end]);
    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}
