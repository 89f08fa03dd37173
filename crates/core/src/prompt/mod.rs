use std::sync::OnceLock;

use regex::Regex;

use crate::domain::message::{ChatMessage, Role};
use crate::market::{StockAnalyzer, StockRecord};

const PERSONA: &str = "You are a helpful AI assistant that specializes in stock analysis.";

const ASK_FOR_SYMBOL: &str = "If the user asks about a specific stock, ask them to provide \
                              a valid stock symbol (like AAPL, MSFT, TSLA, etc.).";

const INCORPORATE: &str = "Incorporate this information into your response in a helpful way. \
                           Format the data nicely and provide additional context or advice \
                           if appropriate.";

/// First standalone run of 1-5 uppercase ASCII letters. Word boundaries keep
/// the leading capital of ordinary words ("Tell", "Analyze") from matching,
/// but all-caps English words ("OK") still do; that looseness is intended.
pub fn extract_symbol(text: &str) -> Option<&str> {
    static SYMBOL_RE: OnceLock<Regex> = OnceLock::new();
    let re = SYMBOL_RE.get_or_init(|| Regex::new(r"\b[A-Z]{1,5}\b").expect("valid symbol regex"));
    re.find(text).map(|m| m.as_str())
}

/// Content of the last `user` message, or empty text if there is none.
pub fn last_user_content(messages: &[ChatMessage]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

/// Builds the system prompt for a conversation: persona preamble plus either
/// a data block for the extracted symbol or a generic ask-for-a-symbol
/// instruction. The analyzer lookup carries the simulated quote latency.
pub async fn augment(messages: &[ChatMessage], analyzer: &StockAnalyzer) -> String {
    let content = last_user_content(messages);
    match extract_symbol(content) {
        Some(symbol) => {
            let record = analyzer.analyze(symbol).await;
            tracing::debug!(%symbol, recommendation = %record.recommendation, "augmenting prompt with stock data");
            render_with_data(symbol, record)
        }
        None => format!("{PERSONA}\n\n{ASK_FOR_SYMBOL}"),
    }
}

fn render_with_data(symbol: &str, record: &StockRecord) -> String {
    format!(
        "{PERSONA}\n\n\
         Here is the latest data for the requested stock:\n\
         - Symbol: {symbol}\n\
         - Current Price: ${price}\n\
         - Change: {change} ({change_percent}%)\n\
         - Recommendation: {recommendation}\n\
         - Analysis: {analysis}\n\n\
         {INCORPORATE}",
        price = record.price,
        change = signed(record.change),
        change_percent = signed(record.change_percent),
        recommendation = record.recommendation,
        analysis = record.analysis,
    )
}

// Plus sign only for strictly positive values, matching the data block the
// UI was built against ("+1.25 (+0.67%)", "-3.45 (-1.9%)", "0 (0%)").
fn signed(value: f64) -> String {
    if value > 0.0 {
        format!("+{value}")
    } else {
        format!("{value}")
    }
}
