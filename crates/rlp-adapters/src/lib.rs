//! Listing-source contracts and HTML card parsers for the built-in rental sites.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rlp_core::Listing;
use rlp_storage::{FetchError, FetchedResponse, PageFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "rlp-adapters";

pub const DEFAULT_MAX_PAGES: u32 = 5;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{source_id}: page declares access denied")]
    AccessDenied { source_id: String },
    #[error("{source_id}: page has neither listing cards nor an empty-results marker")]
    UnrecognizedPage { source_id: String },
    #[error("{source_id}: found {cards} listing cards but none had rent, address and link")]
    NoUsableCards { source_id: String, cards: usize },
    #[error("invalid selector `{selector}`: {reason}")]
    InvalidSelector { selector: String, reason: String },
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no listing source registered for `{0}`")]
    UnknownSource(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A site that lists rentals per area code, one HTML page at a time.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &str;

    fn max_pages(&self) -> u32;

    fn page_url(&self, area_code: &str, page: u32) -> String;

    fn parse_page(
        &self,
        area_code: &str,
        html: &str,
        scraped_at: DateTime<Utc>,
    ) -> Result<Vec<Listing>, ParseError>;

    async fn fetch_page(
        &self,
        fetcher: &dyn PageFetcher,
        area_code: &str,
        page: u32,
    ) -> Result<FetchedResponse, FetchError> {
        let url = self.page_url(area_code, page);
        fetcher
            .fetch(
                &url,
                &[
                    ("accept", "text/html,application/xhtml+xml"),
                    ("accept-language", "en-US,en;q=0.9"),
                ],
            )
            .await
    }
}

/// Declarative description of a card-list results page.
#[derive(Debug, Clone)]
pub struct CardLayout {
    pub source_id: String,
    pub base_url: String,
    /// Placeholders: `{area}`, `{page}`, `{max_rent}`, `{max_rent_k}`.
    pub url_template: String,
    pub max_rent: u32,
    pub max_pages: u32,
    /// Tried in order; the first selector that matches anything wins.
    pub card_selectors: Vec<String>,
    pub price_selector: Option<String>,
    /// One element per unit fact (`2 beds`, `Studio`, `1 bath`).
    pub stats_selector: Option<String>,
    pub address_selector: String,
    pub link_selector: String,
    pub empty_markers: Vec<String>,
    pub denied_markers: Vec<String>,
}

pub fn redfin_layout() -> CardLayout {
    CardLayout {
        source_id: "redfin".to_string(),
        base_url: "https://www.redfin.com".to_string(),
        url_template:
            "https://www.redfin.com/zipcode/{area}/rentals/filter/max-price={max_rent_k}/page-{page}"
                .to_string(),
        max_rent: 3000,
        max_pages: DEFAULT_MAX_PAGES,
        card_selectors: vec![
            ".MapHomeCard".to_string(),
            ".HomeCard".to_string(),
            "div[data-testid=\"property-card\"]".to_string(),
        ],
        price_selector: Some(
            ".homecardV2Price, [data-rf-test-name=\"homecard-price\"], .bp-Homecard__Price".to_string(),
        ),
        stats_selector: Some(".HomeStatsV2 .stats, .stats".to_string()),
        address_selector: "a[href*=\"/home/\"], a[href*=\"/apartment/\"], .homeAddressV2".to_string(),
        link_selector: "a[href*=\"/home/\"], a[href*=\"/apartment/\"]".to_string(),
        empty_markers: vec![
            "No results found".to_string(),
            "No matching rentals".to_string(),
        ],
        denied_markers: vec![
            "Access to this page has been denied".to_string(),
            "verify that you're a human".to_string(),
        ],
    }
}

pub fn zillow_layout() -> CardLayout {
    CardLayout {
        source_id: "zillow".to_string(),
        base_url: "https://www.zillow.com".to_string(),
        url_template: "https://www.zillow.com/{area}/rentals/{page}_p/".to_string(),
        max_rent: 3000,
        max_pages: DEFAULT_MAX_PAGES,
        card_selectors: vec![
            "[data-testid=\"property-card\"]".to_string(),
            "[data-testid=\"list-card\"]".to_string(),
            "article.list-card".to_string(),
            "div[class*=\"property-card\"]".to_string(),
        ],
        price_selector: Some("[data-testid=\"property-card-price\"], .price".to_string()),
        stats_selector: Some(".property-card-details li".to_string()),
        address_selector: "[data-testid=\"property-card-addr\"], address, .list-card-addr".to_string(),
        link_selector: "a[href*=\"/homedetails/\"], a[href*=\"/rental/\"], a[href*=\"/b/\"]".to_string(),
        empty_markers: vec![
            "No matching results".to_string(),
            "No results found".to_string(),
        ],
        denied_markers: vec![
            "Access to this page has been denied".to_string(),
            "Press & Hold to confirm you are".to_string(),
        ],
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ParseError> {
    Selector::parse(selector).map_err(|e| ParseError::InvalidSelector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

/// A [`CardLayout`] with its selectors compiled once.
#[derive(Debug, Clone)]
pub struct HtmlCardSource {
    layout: CardLayout,
    cards: Vec<Selector>,
    price: Option<Selector>,
    stats: Option<Selector>,
    address: Selector,
    link: Selector,
}

impl HtmlCardSource {
    pub fn new(layout: CardLayout) -> Result<Self, ParseError> {
        let cards = layout
            .card_selectors
            .iter()
            .map(|s| parse_selector(s))
            .collect::<Result<Vec<_>, _>>()?;
        let price = layout.price_selector.as_deref().map(parse_selector).transpose()?;
        let stats = layout.stats_selector.as_deref().map(parse_selector).transpose()?;
        let address = parse_selector(&layout.address_selector)?;
        let link = parse_selector(&layout.link_selector)?;
        Ok(Self {
            layout,
            cards,
            price,
            stats,
            address,
            link,
        })
    }

    pub fn layout(&self) -> &CardLayout {
        &self.layout
    }

    fn parse_card(
        &self,
        card: ElementRef<'_>,
        area_code: &str,
        scraped_at: DateTime<Utc>,
    ) -> Option<Listing> {
        let card_text = element_text(card);

        let price_text = self
            .price
            .as_ref()
            .and_then(|sel| card.select(sel).next())
            .map(element_text)
            .unwrap_or_else(|| card_text.clone());
        let rent = parse_rent(&price_text)?;

        let address = card
            .select(&self.address)
            .next()
            .and_then(|el| text_or_none(element_text(el)))?;
        let href = card
            .select(&self.link)
            .next()
            .and_then(|el| el.value().attr("href"))
            .and_then(|h| text_or_none(h.to_string()))?;
        let listing_url = absolutize(&self.layout.base_url, &href);

        let facts: Vec<String> = self
            .stats
            .as_ref()
            .map(|sel| card.select(sel).map(element_text).collect())
            .unwrap_or_default();
        let bedrooms = parse_bedrooms(&facts)
            .or_else(|| number_before(&card_text, BED_UNITS).map(|v| v as u32));

        Some(Listing {
            source_id: self.layout.source_id.clone(),
            area_code: area_code.to_string(),
            address,
            rent,
            bedrooms,
            bathrooms: number_before(&card_text, &["ba", "bath", "baths"]),
            square_feet: number_before(&card_text, &["sqft", "sq"]).map(|v| v as u32),
            listing_url: Some(listing_url),
            scraped_at,
        })
    }
}

#[async_trait]
impl ListingSource for HtmlCardSource {
    fn source_id(&self) -> &str {
        &self.layout.source_id
    }

    fn max_pages(&self) -> u32 {
        self.layout.max_pages
    }

    fn page_url(&self, area_code: &str, page: u32) -> String {
        self.layout
            .url_template
            .replace("{area}", area_code)
            .replace("{page}", &page.to_string())
            .replace("{max_rent_k}", &compact_thousands(self.layout.max_rent))
            .replace("{max_rent}", &self.layout.max_rent.to_string())
    }

    fn parse_page(
        &self,
        area_code: &str,
        html: &str,
        scraped_at: DateTime<Utc>,
    ) -> Result<Vec<Listing>, ParseError> {
        let document = Html::parse_document(html);
        let page_text = element_text(document.root_element());
        let source_id = self.layout.source_id.clone();

        if contains_any(&page_text, &self.layout.denied_markers) {
            return Err(ParseError::AccessDenied { source_id });
        }

        let cards: Vec<ElementRef<'_>> = self
            .cards
            .iter()
            .map(|sel| document.select(sel).collect::<Vec<_>>())
            .find(|found| !found.is_empty())
            .unwrap_or_default();

        if cards.is_empty() {
            if contains_any(&page_text, &self.layout.empty_markers) {
                return Ok(Vec::new());
            }
            return Err(ParseError::UnrecognizedPage { source_id });
        }

        let listings: Vec<Listing> = cards
            .iter()
            .filter_map(|card| self.parse_card(*card, area_code, scraped_at))
            .collect();
        if listings.is_empty() {
            return Err(ParseError::NoUsableCards {
                source_id,
                cards: cards.len(),
            });
        }
        Ok(listings)
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    let lower = haystack.to_lowercase();
    needles
        .iter()
        .any(|needle| lower.contains(&needle.to_lowercase()))
}

fn absolutize(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if href.starts_with('/') {
        format!("{}{}", base_url.trim_end_matches('/'), href)
    } else {
        format!("{}/{}", base_url.trim_end_matches('/'), href)
    }
}

/// 1500 -> "1.5k", 3000 -> "3k", 900 -> "900".
fn compact_thousands(value: u32) -> String {
    if value < 1000 {
        return value.to_string();
    }
    let whole = value / 1000;
    let tenths = (value % 1000) / 100;
    if tenths == 0 {
        format!("{whole}k")
    } else {
        format!("{whole}.{tenths}k")
    }
}

/// First `$`-prefixed amount in the text, commas allowed.
fn parse_rent(text: &str) -> Option<f64> {
    let (_, after) = text.split_once('$')?;
    let digits: String = after
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .filter(|c| *c != ',')
        .collect();
    let rent: f64 = digits.parse().ok()?;
    (rent > 0.0).then_some(rent)
}

const BED_UNITS: &[&str] = &["bd", "bds", "bed", "beds", "br"];

/// "Studio" only counts when it leads a stats fact, never in free card text.
fn parse_bedrooms(facts: &[String]) -> Option<u32> {
    facts.iter().find_map(|fact| match tokenize(fact).first() {
        Some(Token::Word(w)) if w == "studio" => Some(0),
        _ => number_before(fact, BED_UNITS).map(|v| v as u32),
    })
}

#[derive(Debug, PartialEq)]
enum Token {
    Number(f64),
    Word(String),
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut number = String::new();
    let mut word = String::new();
    for ch in text.to_lowercase().chars() {
        if ch.is_ascii_digit() || (ch == '.' && !number.is_empty() && !number.contains('.')) {
            if !word.is_empty() {
                tokens.push(Token::Word(std::mem::take(&mut word)));
            }
            number.push(ch);
        } else if ch == ',' && !number.is_empty() {
            continue;
        } else if ch.is_alphabetic() {
            if let Ok(v) = number.trim_end_matches('.').parse::<f64>() {
                tokens.push(Token::Number(v));
            }
            number.clear();
            word.push(ch);
        } else {
            if let Ok(v) = number.trim_end_matches('.').parse::<f64>() {
                tokens.push(Token::Number(v));
            }
            number.clear();
            if !word.is_empty() {
                tokens.push(Token::Word(std::mem::take(&mut word)));
            }
        }
    }
    if let Ok(v) = number.trim_end_matches('.').parse::<f64>() {
        tokens.push(Token::Number(v));
    }
    if !word.is_empty() {
        tokens.push(Token::Word(word));
    }
    tokens
}

/// The number immediately followed by one of `units`, e.g. `2 beds` or `1,104 sq ft`.
fn number_before(text: &str, units: &[&str]) -> Option<f64> {
    let tokens = tokenize(text);
    tokens.windows(2).find_map(|pair| match pair {
        [Token::Number(v), Token::Word(w)] if units.contains(&w.as_str()) => Some(*v),
        _ => None,
    })
}

pub fn builtin_layout(source_id: &str) -> Option<CardLayout> {
    match source_id {
        "redfin" => Some(redfin_layout()),
        "zillow" => Some(zillow_layout()),
        _ => None,
    }
}

pub fn source_for_id(source_id: &str) -> Result<Box<dyn ListingSource>, AdapterError> {
    let layout =
        builtin_layout(source_id).ok_or_else(|| AdapterError::UnknownSource(source_id.to_string()))?;
    Ok(Box::new(HtmlCardSource::new(layout)?))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default)]
    pub max_rent: Option<u32>,
    #[serde(default)]
    pub url_template: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_max_pages() -> u32 {
    DEFAULT_MAX_PAGES
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

/// Built-in layout for the configured id with registry overrides applied.
pub fn build_source(config: &SourceConfig) -> Result<Box<dyn ListingSource>, AdapterError> {
    let mut layout = builtin_layout(&config.source_id)
        .ok_or_else(|| AdapterError::UnknownSource(config.source_id.clone()))?;
    layout.max_pages = config.max_pages.max(1);
    if let Some(max_rent) = config.max_rent {
        layout.max_rent = max_rent;
    }
    if let Some(template) = &config.url_template {
        layout.url_template = template.clone();
    }
    Ok(Box::new(HtmlCardSource::new(layout)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn redfin_urls_use_compact_price_and_page() {
        let source = source_for_id("redfin").expect("redfin");
        assert_eq!(
            source.page_url("78704", 2),
            "https://www.redfin.com/zipcode/78704/rentals/filter/max-price=3k/page-2"
        );
        assert_eq!(compact_thousands(1500), "1.5k");
        assert_eq!(compact_thousands(950), "950");
    }

    #[test]
    fn number_extraction_handles_glued_units_and_commas() {
        assert_eq!(number_before("2bd 1ba", &["bd"]), Some(2.0));
        assert_eq!(number_before("2bd 1ba", &["ba"]), Some(1.0));
        assert_eq!(number_before("1,104 sq ft", &["sq", "sqft"]), Some(1104.0));
        assert_eq!(number_before("1.5 baths", &["baths"]), Some(1.5));
        assert_eq!(number_before("1900 S 1st St", &["bd", "bed"]), None);
    }

    #[test]
    fn rent_parses_first_dollar_amount() {
        assert_eq!(parse_rent("$1,395/mo"), Some(1395.0));
        assert_eq!(parse_rent("From $2,150+/mo"), Some(2150.0));
        assert_eq!(parse_rent("Contact for price"), None);
        assert_eq!(parse_rent("$"), None);
    }

    #[test]
    fn studio_means_zero_bedrooms() {
        let facts = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(parse_bedrooms(&facts(&["Studio", "1 bath", "450 sq ft"])), Some(0));
        assert_eq!(parse_bedrooms(&facts(&["3 beds", "2 baths"])), Some(3));
        assert_eq!(parse_bedrooms(&facts(&["1 ba", "Studio Lofts"])), Some(0));
        assert_eq!(parse_bedrooms(&facts(&["price only"])), None);
        assert_eq!(parse_bedrooms(&[]), None);
    }

    #[test]
    fn studio_in_address_or_name_does_not_zero_bedrooms() {
        let redfin = source_for_id("redfin").expect("redfin");
        let html = r#"
            <div class="MapHomeCard">
              <span class="homecardV2Price">$1,650/mo</span>
              <div class="HomeStatsV2">
                <div class="stats">2 beds</div>
                <div class="stats">1 bath</div>
              </div>
              <a href="/TX/Austin/500-W-2nd-St/apartment/42">Studio Lofts | 500 W 2nd St, Austin, TX 78701</a>
            </div>"#;
        let listings = redfin.parse_page("78701", html, ts()).expect("card parses");
        assert_eq!(listings[0].bedrooms, Some(2));

        let zillow = source_for_id("zillow").expect("zillow");
        let html = r#"
            <article data-testid="property-card">
              <a href="/homedetails/9-Studio-Ct/9_zpid/"><address data-testid="property-card-addr">9 Studio Ct, Austin, TX 78702</address></a>
              <span data-testid="property-card-price">$1,400/mo</span>
              <ul class="property-card-details"><li><b>1</b> bds</li><li><b>1</b> ba</li></ul>
            </article>
            <article data-testid="property-card">
              <a href="/homedetails/7-Studio-Ct/7_zpid/"><address data-testid="property-card-addr">7 Studio Ct, Austin, TX 78702</address></a>
              <span data-testid="property-card-price">$1,100/mo</span>
              <ul class="property-card-details"><li>Studio</li><li><b>1</b> ba</li></ul>
            </article>"#;
        let listings = zillow.parse_page("78702", html, ts()).expect("cards parse");
        assert_eq!(listings[0].bedrooms, Some(1));
        assert_eq!(listings[1].bedrooms, Some(0));
    }

    #[test]
    fn malformed_cards_are_skipped_but_all_bad_is_an_error() {
        let source = source_for_id("zillow").expect("zillow");
        let html = r#"
            <article data-testid="property-card">
              <span data-testid="property-card-price">$1,200/mo</span>
              <address data-testid="property-card-addr">1 Main St, Austin, TX 78701</address>
            </article>"#;
        let err = source.parse_page("78701", html, ts()).expect_err("no link anywhere");
        assert!(matches!(err, ParseError::NoUsableCards { cards: 1, .. }));

        let mixed = r#"
            <article data-testid="property-card">
              <span data-testid="property-card-price">$1,200/mo</span>
              <a href="/homedetails/1-Main-St/1_zpid/"><address data-testid="property-card-addr">1 Main St, Austin, TX 78701</address></a>
              <ul><li>1 bd</li><li>1 ba</li></ul>
            </article>
            <article data-testid="property-card">
              <span data-testid="property-card-price">Call for rent</span>
              <a href="/homedetails/2-Main-St/2_zpid/"><address>2 Main St</address></a>
            </article>"#;
        let listings = source.parse_page("78701", mixed, ts()).expect("one usable card");
        assert_eq!(listings.len(), 1);
        assert_eq!(
            listings[0].listing_url.as_deref(),
            Some("https://www.zillow.com/homedetails/1-Main-St/1_zpid/")
        );
        assert_eq!(listings[0].bedrooms, Some(1));
    }

    #[test]
    fn pages_without_cards_need_an_empty_marker() {
        let source = source_for_id("redfin").expect("redfin");
        let empty = "<html><body><p>No results found. Try a larger area.</p></body></html>";
        assert!(source.parse_page("78704", empty, ts()).expect("empty").is_empty());

        let garbage = "<html><body><h1>Maintenance</h1></body></html>";
        assert!(matches!(
            source.parse_page("78704", garbage, ts()),
            Err(ParseError::UnrecognizedPage { .. })
        ));
    }

    #[test]
    fn registry_overrides_builtin_layout() {
        let registry: SourceRegistry = serde_yaml::from_str(
            r#"
sources:
  - source_id: redfin
    display_name: Redfin
    enabled: true
    max_pages: 2
    max_rent: 1500
  - source_id: zillow
    display_name: Zillow
    enabled: false
"#,
        )
        .expect("yaml");
        let enabled: Vec<_> = registry.enabled().collect();
        assert_eq!(enabled.len(), 1);
        let source = build_source(enabled[0]).expect("build");
        assert_eq!(source.max_pages(), 2);
        assert!(source.page_url("78701", 1).contains("max-price=1.5k/page-1"));
        assert_eq!(registry.sources[1].max_pages, DEFAULT_MAX_PAGES);

        let unknown = SourceConfig {
            source_id: "craigslist".to_string(),
            display_name: "Craigslist".to_string(),
            enabled: true,
            max_pages: 1,
            max_rent: None,
            url_template: None,
            notes: None,
        };
        assert!(matches!(build_source(&unknown), Err(AdapterError::UnknownSource(_))));
    }
}
