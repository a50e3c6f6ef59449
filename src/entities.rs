//! Entity extraction: lexes a chat message into structured spans.
//!
//! The extractor is a pure function over a [`ParserContext`] carrying the
//! known emote, nick, tag and emote-modifier sets. All four sets are
//! independently mutable and safe for concurrent readers; the emote set is
//! atomically replaced by the manifest sync task.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Byte-offset bounds `[start, end)` into the message.
pub type Bounds = [usize; 2];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Link {
    pub url: String,
    pub bounds: Bounds,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Emote {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub modifiers: Vec<String>,
    pub bounds: Bounds,
    /// Combo counter stamped by the combo tracker; zero means no combo.
    #[serde(skip_serializing_if = "is_zero")]
    pub combo: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Nick {
    pub nick: String,
    pub bounds: Bounds,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub bounds: Bounds,
}

/// A bounds-only span: code, spoiler, greentext or "me".
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Span {
    pub bounds: Bounds,
}

/// All entities extracted from one message.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Entities {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub emotes: Vec<Emote>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nicks: Vec<Nick>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<Span>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub spoilers: Vec<Span>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greentext: Option<Span>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub me: Option<Span>,
}

/// A mutable token set safe for concurrent readers.
#[derive(Debug, Default)]
pub struct TokenSet {
    inner: RwLock<HashSet<String>>,
}

impl TokenSet {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: RwLock::new(tokens.into_iter().map(Into::into).collect()),
        }
    }

    pub fn insert(&self, token: &str) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token.to_string());
    }

    pub fn remove(&self, token: &str) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(token);
    }

    /// Atomically swap the whole set. Readers observe either the old or
    /// the new set, never a partial one.
    pub fn replace<I, S>(&self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let next: HashSet<String> = tokens.into_iter().map(Into::into).collect();
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = next;
    }

    pub fn contains(&self, token: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(token)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The known-token sets the lexer matches against.
#[derive(Debug, Default)]
pub struct ParserContext {
    pub emotes: TokenSet,
    pub nicks: TokenSet,
    pub tags: TokenSet,
    pub emote_modifiers: TokenSet,
}

/// Built-in message tags.
pub const DEFAULT_TAGS: &[&str] = &["nsfw", "weeb", "nsfl", "loud"];

/// Built-in emote modifiers.
pub const DEFAULT_EMOTE_MODIFIERS: &[&str] = &[
    "mirror", "flip", "rain", "snow", "rustle", "worth", "love", "spin", "wide", "lag", "hyper",
];

/// Relaxed URL matcher: scheme-prefixed or `www.`-prefixed runs up to
/// whitespace or angle brackets.
pub fn url_regex() -> Regex {
    Regex::new(r#"(?i)\b(?:[a-z][a-z0-9+.-]*://|www\.)[^\s<>"]+"#)
        .expect("static url pattern")
}

pub struct EntityExtractor {
    pub ctx: ParserContext,
    urls: Regex,
}

impl EntityExtractor {
    pub fn new(ctx: ParserContext) -> Self {
        Self { ctx, urls: url_regex() }
    }

    pub fn add_nick(&self, nick: &str) {
        self.ctx.nicks.insert(nick);
    }

    pub fn remove_nick(&self, nick: &str) {
        self.ctx.nicks.remove(nick);
    }

    /// Extract all entities from a message.
    pub fn extract(&self, msg: &str) -> Entities {
        let mut entities = Entities::default();

        for m in self.urls.find_iter(msg) {
            entities.links.push(Link {
                url: m.as_str().to_string(),
                bounds: [m.start(), m.end()],
            });
        }

        if msg.starts_with('>') {
            entities.greentext = Some(Span { bounds: [0, msg.len()] });
        } else if msg.starts_with("/me ") {
            entities.me = Some(Span { bounds: [0, msg.len()] });
        }

        let codes = delimited_spans(msg, "`");
        let spoilers = delimited_spans_excluding(msg, "||", &codes);

        for (start, end, word) in words(msg) {
            // code spans hold raw text
            if codes.iter().any(|c| start >= c[0] && end <= c[1]) {
                continue;
            }
            let (start, word) = trim_markers(&entities, start, word);
            if word.is_empty() {
                continue;
            }
            let end = start + word.len();
            self.match_word(&mut entities, start, end, word);
        }

        // leaves swallowed by a link are dropped
        let links = entities.links.clone();
        let inside_link =
            |b: &Bounds| links.iter().any(|l| b[0] >= l.bounds[0] && b[1] <= l.bounds[1]);
        entities.emotes.retain(|e| !inside_link(&e.bounds));
        entities.nicks.retain(|n| !inside_link(&n.bounds));
        entities.tags.retain(|t| !inside_link(&t.bounds));

        entities.codes = codes.into_iter().map(|bounds| Span { bounds }).collect();
        entities.spoilers = spoilers.into_iter().map(|bounds| Span { bounds }).collect();

        entities
    }

    fn match_word(&self, entities: &mut Entities, start: usize, end: usize, word: &str) {
        if let Some((name, modifiers)) = self.match_emote(word) {
            entities.emotes.push(Emote {
                name,
                modifiers,
                bounds: [start, end],
                combo: 0,
            });
        } else if self.ctx.nicks.contains(word) {
            entities.nicks.push(Nick {
                nick: word.to_string(),
                bounds: [start, end],
            });
        } else if self.ctx.tags.contains(word) {
            entities.tags.push(Tag {
                name: word.to_string(),
                bounds: [start, end],
            });
        }
    }

    /// An emote word is `Name` or `Name:mod1:mod2...` where every modifier
    /// is known. An unknown modifier disqualifies the whole word.
    fn match_emote(&self, word: &str) -> Option<(String, Vec<String>)> {
        let mut parts = word.split(':');
        let name = parts.next()?;
        if !self.ctx.emotes.contains(name) {
            return None;
        }
        let mut modifiers = Vec::new();
        for part in parts {
            if !self.ctx.emote_modifiers.contains(part) {
                return None;
            }
            modifiers.push(part.to_string());
        }
        Some((name.to_string(), modifiers))
    }
}

/// Strip the greentext `>` or `/me` marker off the first word.
fn trim_markers<'a>(entities: &Entities, start: usize, word: &'a str) -> (usize, &'a str) {
    if start == 0 {
        if entities.greentext.is_some() {
            if let Some(stripped) = word.strip_prefix('>') {
                return (start + 1, stripped);
            }
        } else if entities.me.is_some() && word == "/me" {
            return (start, "");
        }
    }
    (start, word)
}

/// Whitespace-separated words with their byte offsets.
fn words(msg: &str) -> Vec<(usize, usize, &str)> {
    let mut out = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in msg.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                out.push((s, i, &msg[s..i]));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        out.push((s, msg.len(), &msg[s..]));
    }
    out
}

/// Paired-delimiter spans (`` ` `` code marks), bounds including the
/// delimiters. Unpaired trailing delimiters are left as plain text.
fn delimited_spans(msg: &str, delim: &str) -> Vec<Bounds> {
    delimited_spans_excluding(msg, delim, &[])
}

fn delimited_spans_excluding(msg: &str, delim: &str, exclude: &[Bounds]) -> Vec<Bounds> {
    let mut spans = Vec::new();
    let mut open: Option<usize> = None;
    let mut i = 0;
    while i + delim.len() <= msg.len() {
        if !msg.is_char_boundary(i) || !msg[i..].starts_with(delim) {
            i += 1;
            continue;
        }
        if exclude.iter().any(|b| i >= b[0] && i < b[1]) {
            i += 1;
            continue;
        }
        match open.take() {
            None => open = Some(i),
            Some(s) => spans.push([s, i + delim.len()]),
        }
        i += delim.len();
    }
    spans
}

// ============================================================================
// Emote manifest sync
// ============================================================================

#[derive(Debug, Deserialize)]
struct Manifest {
    emotes: Vec<ManifestEmote>,
}

#[derive(Debug, Deserialize)]
struct ManifestEmote {
    name: String,
}

/// Fetch the emote manifest and return the emote names.
pub async fn load_emote_manifest(
    client: &reqwest::Client,
    url: &str,
) -> Result<Vec<String>, reqwest::Error> {
    let manifest: Manifest = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(manifest.emotes.into_iter().map(|e| e.name).collect())
}

/// Refresh the emote set every minute. A successful fetch atomically
/// replaces the set; failures leave the previous set in place.
pub async fn run_emote_sync(extractor: Arc<EntityExtractor>, client: reqwest::Client, url: String) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match load_emote_manifest(&client, &url).await {
            Ok(emotes) => {
                debug!(count = emotes.len(), "emote manifest refreshed");
                extractor.ctx.emotes.replace(emotes);
            }
            Err(e) => warn!(error = %e, "failed to update emotes"),
        }
    }
}
