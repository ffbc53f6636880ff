//! Product page scraping.
//!
//! Marketplace pages are tried first with their well-known element ids; any
//! page falls back to OpenGraph / `<title>` / meta description so the scrape
//! stage always has something to ground on.

use super::ToolError;
use crate::config::HttpSettings;
use crate::http::build_client;
use crate::product_url::canonical_product_url;
use once_cell::sync::Lazy;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use tracing::debug;

const EXCERPT_CHARS: usize = 1500;

static PRODUCT_TITLE: Lazy<Selector> = Lazy::new(|| selector("#productTitle"));
static FEATURE_BULLETS: Lazy<Selector> = Lazy::new(|| selector("#feature-bullets li"));
static DESCRIPTION_PARAGRAPHS: Lazy<Selector> = Lazy::new(|| selector("#productDescription p"));
static CATEGORY_LINK: Lazy<Selector> =
    Lazy::new(|| selector("a.a-link-normal.a-color-tertiary"));
static OG_TITLE: Lazy<Selector> = Lazy::new(|| selector(r#"meta[property="og:title"]"#));
static OG_DESCRIPTION: Lazy<Selector> =
    Lazy::new(|| selector(r#"meta[property="og:description"]"#));
static META_DESCRIPTION: Lazy<Selector> = Lazy::new(|| selector(r#"meta[name="description"]"#));
static DOCUMENT_TITLE: Lazy<Selector> = Lazy::new(|| selector("title"));
static BODY: Lazy<Selector> = Lazy::new(|| selector("body"));
static NOISE: Lazy<Selector> = Lazy::new(|| selector("script, style, noscript"));

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ScrapedPage {
    pub url: String,
    pub title: Option<String>,
    pub description: Vec<String>,
    pub category: Option<String>,
    pub excerpt: String,
}

impl ScrapedPage {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_empty() && self.excerpt.is_empty()
    }
}

#[derive(Clone)]
pub struct PageScraper {
    http: Client,
}

impl PageScraper {
    pub fn new(http: &HttpSettings) -> Self {
        Self {
            http: build_client(http),
        }
    }

    pub async fn fetch(&self, url: &str) -> Result<ScrapedPage, ToolError> {
        let target = canonical_product_url(url);
        let response = self
            .http
            .get(&target)
            .send()
            .await
            .map_err(|err| ToolError::Request(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::Request(format!("HTTP {status}")));
        }
        let body = response
            .text()
            .await
            .map_err(|err| ToolError::Request(err.to_string()))?;
        let page = parse_product_page(&target, &body);
        debug!(
            target = "listing.tools",
            url = %target,
            has_title = page.title.is_some(),
            bullets = page.description.len(),
            "page_scraped"
        );
        if page.is_empty() {
            return Err(ToolError::Empty(target));
        }
        Ok(page)
    }
}

pub fn parse_product_page(url: &str, html: &str) -> ScrapedPage {
    let document = Html::parse_document(html);

    let title = first_text(&document, &PRODUCT_TITLE)
        .or_else(|| meta_content(&document, &OG_TITLE))
        .or_else(|| first_text(&document, &DOCUMENT_TITLE));

    let mut description = all_text(&document, &FEATURE_BULLETS);
    if description.is_empty() {
        description = all_text(&document, &DESCRIPTION_PARAGRAPHS);
    }
    if description.is_empty()
        && let Some(meta) = meta_content(&document, &OG_DESCRIPTION)
            .or_else(|| meta_content(&document, &META_DESCRIPTION))
    {
        description.push(meta);
    }

    let category = first_text(&document, &CATEGORY_LINK);

    ScrapedPage {
        url: url.to_string(),
        title,
        description,
        category,
        excerpt: body_excerpt(&document),
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_text(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .map(element_text)
        .find(|text| !text.is_empty())
}

fn all_text(document: &Html, selector: &Selector) -> Vec<String> {
    document
        .select(selector)
        .map(element_text)
        .filter(|text| !text.is_empty())
        .collect()
}

fn meta_content(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .filter_map(|el| el.value().attr("content"))
        .map(|content| content.split_whitespace().collect::<Vec<_>>().join(" "))
        .find(|content| !content.is_empty())
}

fn body_excerpt(document: &Html) -> String {
    let Some(body) = document.select(&BODY).next() else {
        return String::new();
    };
    let noise: Vec<_> = body.select(&NOISE).map(|el| el.id()).collect();
    let mut words = Vec::new();
    for node in body.descendants() {
        if let Some(text) = node.value().as_text() {
            let inside_noise = node.ancestors().any(|ancestor| noise.contains(&ancestor.id()));
            if !inside_noise {
                words.extend(text.split_whitespace());
            }
        }
    }
    let joined = words.join(" ");
    joined.chars().take(EXCERPT_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const AMAZON_FIXTURE: &str = r#"
        <html><head><title>Amazon.com: Knee Brace</title></head>
        <body>
          <a class="a-link-normal a-color-tertiary" href="/sports">  Sports &amp; Outdoors </a>
          <span id="productTitle">
              Patella Tendon Knee Strap
          </span>
          <div id="feature-bullets"><ul>
            <li><span>Relieves knee pain</span></li>
            <li>   </li>
            <li><span>Adjustable   fit</span></li>
          </ul></div>
          <script>var tracking = "ignore me";</script>
        </body></html>
    "#;

    #[test]
    fn extracts_marketplace_fields() {
        let page = parse_product_page("https://www.amazon.com/dp/B07DLFP8Q5", AMAZON_FIXTURE);
        assert_eq!(page.title.as_deref(), Some("Patella Tendon Knee Strap"));
        assert_eq!(page.description, vec!["Relieves knee pain", "Adjustable fit"]);
        assert_eq!(page.category.as_deref(), Some("Sports & Outdoors"));
        assert!(page.excerpt.contains("Relieves knee pain"));
        assert!(!page.excerpt.contains("ignore me"));
    }

    #[test]
    fn falls_back_to_product_description_paragraphs() {
        let html = r#"<html><body>
            <h1 id="productTitle">Lamp</h1>
            <div id="productDescription"><p>Warm light.</p><p></p><p>Dimmable.</p></div>
        </body></html>"#;
        let page = parse_product_page("https://shop.test/lamp", html);
        assert_eq!(page.description, vec!["Warm light.", "Dimmable."]);
        assert!(page.category.is_none());
    }

    #[test]
    fn generic_pages_use_meta_tags() {
        let html = r#"<html><head>
            <meta property="og:title" content="Trail Running Shoe">
            <meta name="description" content="Lightweight shoe for rough terrain.">
            <title>Shop | Trail Running Shoe</title>
        </head><body><p>Buy now</p></body></html>"#;
        let page = parse_product_page("https://shop.test/shoe", html);
        assert_eq!(page.title.as_deref(), Some("Trail Running Shoe"));
        assert_eq!(page.description, vec!["Lightweight shoe for rough terrain."]);
        assert_eq!(page.excerpt, "Buy now");
    }

    #[test]
    fn blank_document_is_empty() {
        let page = parse_product_page("https://shop.test/", "<html><body></body></html>");
        assert!(page.is_empty());
    }
}
