//! User-agent based bot classification
//!
//! A request's `User-Agent` is matched against known client families. The
//! gate then denies every detected category that is not on its allow-list.
//! Unrecognized agents are treated as human traffic; a missing or blank agent
//! is its own category.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Bot family detected from a user agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotCategory {
    /// Search engine crawlers
    SearchEngine,
    /// Link unfurlers and social previews
    Preview,
    /// Uptime and synthetic monitoring
    Monitor,
    /// AI training and answer-engine crawlers
    AiCrawler,
    /// Headless browsers and browser automation
    Automation,
    /// Generic HTTP tooling and scraping frameworks
    HttpTool,
    /// Vulnerability scanners
    Scanner,
    /// No user agent at all
    Unidentified,
}

impl BotCategory {
    /// Categories exempted by default
    pub const DEFAULT_ALLOWED: [BotCategory; 3] = [Self::SearchEngine, Self::Preview, Self::Monitor];

    /// Stable name for logs and responses
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SearchEngine => "search_engine",
            Self::Preview => "preview",
            Self::Monitor => "monitor",
            Self::AiCrawler => "ai_crawler",
            Self::Automation => "automation",
            Self::HttpTool => "http_tool",
            Self::Scanner => "scanner",
            Self::Unidentified => "unidentified",
        }
    }
}

impl fmt::Display for BotCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Checked in order; scanners first so a scanner spoofing a crawler token is
// still caught.
const SIGNATURES: &[(BotCategory, &[&str])] = &[
    (
        BotCategory::Scanner,
        &[
            "sqlmap", "nikto", "nmap", "masscan", "zgrab", "nuclei", "wpscan", "acunetix",
            "dirbuster", "gobuster", "netsparker", "openvas",
        ],
    ),
    (
        BotCategory::SearchEngine,
        &[
            "googlebot", "bingbot", "duckduckbot", "baiduspider", "yandexbot", "applebot",
            "slurp", "petalbot",
        ],
    ),
    (
        BotCategory::Preview,
        &[
            "facebookexternalhit", "twitterbot", "slackbot", "discordbot", "linkedinbot",
            "telegrambot", "whatsapp", "embedly", "skypeuripreview",
        ],
    ),
    (
        BotCategory::Monitor,
        &[
            "uptimerobot", "pingdom", "statuscake", "datadogsynthetics", "newrelicpinger",
            "betteruptime", "site24x7", "checkly",
        ],
    ),
    (
        BotCategory::AiCrawler,
        &[
            "gptbot", "claudebot", "ccbot", "perplexitybot", "bytespider", "anthropic-ai",
            "google-extended", "amazonbot",
        ],
    ),
    (
        BotCategory::Automation,
        &["headlesschrome", "phantomjs", "selenium", "puppeteer", "playwright", "webdriver"],
    ),
    (
        BotCategory::HttpTool,
        &[
            "python-requests", "python-urllib", "go-http-client", "curl/", "wget/",
            "libwww-perl", "scrapy", "aiohttp", "httpclient", "java/",
        ],
    ),
];

/// Classify a user agent, returning `None` for ordinary clients
pub fn classify_user_agent(user_agent: Option<&str>) -> Option<BotCategory> {
    let Some(ua) = user_agent.map(str::trim).filter(|ua| !ua.is_empty()) else {
        return Some(BotCategory::Unidentified);
    };
    let ua = ua.to_ascii_lowercase();

    SIGNATURES
        .iter()
        .find(|(_, needles)| needles.iter().any(|needle| ua.contains(needle)))
        .map(|(category, _)| *category)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_families() {
        let cases = [
            (
                "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
                Some(BotCategory::SearchEngine),
            ),
            ("Slackbot-LinkExpanding 1.0", Some(BotCategory::Preview)),
            ("Mozilla/5.0+(compatible; UptimeRobot/2.0)", Some(BotCategory::Monitor)),
            ("Mozilla/5.0 AppleWebKit/537.36 (KHTML, like Gecko; compatible; GPTBot/1.1)", Some(BotCategory::AiCrawler)),
            ("Mozilla/5.0 HeadlessChrome/119.0", Some(BotCategory::Automation)),
            ("python-requests/2.31.0", Some(BotCategory::HttpTool)),
            ("sqlmap/1.7 (https://sqlmap.org)", Some(BotCategory::Scanner)),
        ];

        for (ua, expected) in cases {
            assert_eq!(classify_user_agent(Some(ua)), expected, "user agent: {ua}");
        }
    }

    #[test]
    fn test_browsers_and_sdk_clients_pass() {
        let humans = [
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_0) AppleWebKit/605.1.15 Safari/605.1.15",
            "Mozilla/5.0 (X11; Linux x86_64; rv:120.0) Gecko/20100101 Firefox/120.0",
            "mcp-client/1.2.0",
            "node",
        ];
        for ua in humans {
            assert_eq!(classify_user_agent(Some(ua)), None, "user agent: {ua}");
        }
    }

    #[test]
    fn test_missing_user_agent_is_unidentified() {
        assert_eq!(classify_user_agent(None), Some(BotCategory::Unidentified));
        assert_eq!(classify_user_agent(Some("   ")), Some(BotCategory::Unidentified));
    }

    #[test]
    fn test_scanner_wins_over_spoofed_crawler() {
        let ua = "Mozilla/5.0 (compatible; Googlebot/2.1) nikto/2.5";
        assert_eq!(classify_user_agent(Some(ua)), Some(BotCategory::Scanner));
    }
}
