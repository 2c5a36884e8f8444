use crate::error::IngestError;
use crate::traits::PdfParser;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageText {
    /// 1-based page number.
    pub number: u32,
    pub text: String,
}

fn has_readable_text(pages: &[PageText]) -> bool {
    pages.iter().any(|page| !page.text.trim().is_empty())
}

/// Local text-layer extraction with `lopdf`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfParser;

impl LopdfParser {
    fn extract(pdf: &[u8]) -> Result<Vec<PageText>, IngestError> {
        let document =
            Document::load_mem(pdf).map_err(|error| IngestError::Parse(error.to_string()))?;

        let numbers: Vec<u32> = document.get_pages().into_keys().collect();
        if numbers.is_empty() {
            return Err(IngestError::Parse("pdf has no pages".to_string()));
        }

        let pages = numbers
            .into_iter()
            .map(|number| {
                let text = document.extract_text(&[number]).unwrap_or_else(|error| {
                    warn!(page = number, error = %error, "page text extraction failed");
                    String::new()
                });
                PageText { number, text }
            })
            .collect();

        Ok(pages)
    }
}

#[async_trait]
impl PdfParser for LopdfParser {
    async fn parse(&self, pdf: &[u8]) -> Result<Vec<PageText>, IngestError> {
        let owned = pdf.to_vec();
        tokio::task::spawn_blocking(move || Self::extract(&owned))
            .await
            .map_err(|error| IngestError::Parse(format!("parser task failed: {error}")))?
    }
}

#[derive(Debug, Clone, Serialize)]
struct LayoutRequest {
    pdf_base64: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LayoutResponse {
    pages: Option<Vec<LayoutPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LayoutPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

/// Remote layout / OCR service that receives the PDF as base64 JSON.
#[derive(Debug, Clone)]
pub struct RemoteLayoutParser {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl RemoteLayoutParser {
    pub fn new(
        endpoint: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, IngestError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: Url::parse(endpoint)?,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }
}

#[async_trait]
impl PdfParser for RemoteLayoutParser {
    async fn parse(&self, pdf: &[u8]) -> Result<Vec<PageText>, IngestError> {
        let payload = LayoutRequest {
            pdf_base64: STANDARD.encode(pdf),
        };

        let mut request = self.client.post(self.endpoint.clone()).json(&payload);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|error| IngestError::Parse(format!("layout request failed: {error}")))?;

        if !response.status().is_success() {
            return Err(IngestError::Parse(format!(
                "layout request to {} returned {}",
                self.endpoint,
                response.status()
            )));
        }

        let payload: LayoutResponse = response
            .json()
            .await
            .map_err(|error| IngestError::Parse(format!("invalid layout response: {error}")))?;
        payload_to_pages(&payload)
    }
}

fn payload_to_pages(payload: &LayoutResponse) -> Result<Vec<PageText>, IngestError> {
    if let Some(listed) = &payload.pages {
        let pages: Vec<PageText> = listed
            .iter()
            .enumerate()
            .map(|(position, page)| PageText {
                number: page.page.unwrap_or(position as u32 + 1),
                text: page.text.as_deref().unwrap_or_default().trim().to_string(),
            })
            .collect();

        if has_readable_text(&pages) {
            return Ok(pages);
        }
    }

    if let Some(raw_text) = &payload.text {
        let pages: Vec<PageText> = raw_text
            .split('\u{000c}')
            .enumerate()
            .map(|(index, text)| PageText {
                number: index as u32 + 1,
                text: text.trim().to_string(),
            })
            .collect();

        if has_readable_text(&pages) {
            return Ok(pages);
        }
    }

    Err(IngestError::Parse(
        "layout response contained no readable text".to_string(),
    ))
}

/// Tries `primary` first and falls back to `secondary` when the primary parser
/// fails or finds no text layer (typically a scanned PDF).
pub struct FallbackParser<A, B> {
    primary: A,
    secondary: B,
}

impl<A, B> FallbackParser<A, B> {
    pub fn new(primary: A, secondary: B) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl<A: PdfParser, B: PdfParser> PdfParser for FallbackParser<A, B> {
    async fn parse(&self, pdf: &[u8]) -> Result<Vec<PageText>, IngestError> {
        let primary = match self.primary.parse(pdf).await {
            Ok(pages) if has_readable_text(&pages) => return Ok(pages),
            other => other,
        };

        debug!("primary parser found no text, trying fallback parser");
        match (primary, self.secondary.parse(pdf).await) {
            (_, Ok(pages)) => Ok(pages),
            (Ok(pages), Err(error)) => {
                warn!(error = %error, "fallback parser failed, keeping empty text layer");
                Ok(pages)
            }
            (Err(primary_error), Err(fallback_error)) => Err(IngestError::Parse(format!(
                "{primary_error}; fallback parser failed: {fallback_error}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedParser(Result<Vec<PageText>, String>);

    #[async_trait]
    impl PdfParser for FixedParser {
        async fn parse(&self, _pdf: &[u8]) -> Result<Vec<PageText>, IngestError> {
            self.0.clone().map_err(IngestError::Parse)
        }
    }

    fn pages(texts: &[&str]) -> Vec<PageText> {
        texts
            .iter()
            .enumerate()
            .map(|(index, text)| PageText {
                number: index as u32 + 1,
                text: text.to_string(),
            })
            .collect()
    }

    #[test]
    fn layout_payload_keeps_page_numbers_and_empty_pages() {
        let response = LayoutResponse {
            pages: Some(vec![
                LayoutPage {
                    page: Some(2),
                    text: Some("  ".to_string()),
                },
                LayoutPage {
                    page: Some(3),
                    text: Some("Page 3".to_string()),
                },
            ]),
            text: None,
        };

        let pages = payload_to_pages(&response).expect("layout response should be parsed");

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].number, 2);
        assert_eq!(pages[0].text, "");
        assert_eq!(pages[1].number, 3);
        assert_eq!(pages[1].text, "Page 3");
    }

    #[test]
    fn layout_text_is_split_by_form_feed() {
        let response = LayoutResponse {
            pages: None,
            text: Some("First\u{000C}Second\n".to_string()),
        };

        let pages = payload_to_pages(&response).expect("layout response should be parsed");

        assert_eq!(pages, self::pages(&["First", "Second"]));
    }

    #[test]
    fn empty_layout_payload_is_a_parse_error() {
        let response = LayoutResponse {
            pages: Some(Vec::new()),
            text: Some(" \u{000C} ".to_string()),
        };
        assert!(matches!(
            payload_to_pages(&response),
            Err(IngestError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn lopdf_rejects_corrupt_bytes() {
        let result = LopdfParser.parse(b"%PDF-1.4\n%broken").await;
        assert!(matches!(result, Err(IngestError::Parse(_))));
    }

    #[tokio::test]
    async fn fallback_is_skipped_when_primary_has_text() {
        let parser = FallbackParser::new(
            FixedParser(Ok(pages(&["text layer"]))),
            FixedParser(Err("should not be called".to_string())),
        );
        let result = parser.parse(b"pdf").await.unwrap();
        assert_eq!(result, pages(&["text layer"]));
    }

    #[tokio::test]
    async fn fallback_used_for_scanned_documents() {
        let parser = FallbackParser::new(
            FixedParser(Ok(pages(&["", " "]))),
            FixedParser(Ok(pages(&["ocr one", "ocr two"]))),
        );
        let result = parser.parse(b"pdf").await.unwrap();
        assert_eq!(result, pages(&["ocr one", "ocr two"]));
    }

    #[tokio::test]
    async fn both_parsers_failing_is_a_parse_error() {
        let parser = FallbackParser::new(
            FixedParser(Err("corrupt".to_string())),
            FixedParser(Err("ocr down".to_string())),
        );
        let error = parser.parse(b"pdf").await.unwrap_err();
        assert!(matches!(error, IngestError::Parse(message) if message.contains("ocr down")));
    }

    #[tokio::test]
    async fn empty_text_layer_survives_failed_fallback() {
        let parser = FallbackParser::new(
            FixedParser(Ok(pages(&[""]))),
            FixedParser(Err("ocr down".to_string())),
        );
        let result = parser.parse(b"pdf").await.unwrap();
        assert_eq!(result, pages(&[""]));
    }
}
