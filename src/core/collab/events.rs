use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Field-level rule evaluated against a dotted path into the event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MatchRule {
    Eq { path: String, value: Value },
    Contains { path: String, value: String },
    Matches { path: String, pattern: String },
}

impl MatchRule {
    pub fn path(&self) -> &str {
        match self {
            MatchRule::Eq { path, .. }
            | MatchRule::Contains { path, .. }
            | MatchRule::Matches { path, .. } => path,
        }
    }

    /// Reject rules that can never be evaluated (bad regex, empty path).
    pub fn validate(&self) -> Result<(), String> {
        if self.path().trim().is_empty() {
            return Err("match rule path is empty".to_string());
        }
        if let MatchRule::Matches { pattern, .. } = self {
            regex::Regex::new(pattern).map_err(|e| format!("invalid pattern '{}': {}", pattern, e))?;
        }
        Ok(())
    }

    pub fn evaluate(&self, payload: &Value) -> bool {
        let Some(found) = lookup(payload, self.path()) else {
            return false;
        };
        match self {
            MatchRule::Eq { value, .. } => found == value,
            MatchRule::Contains { value, .. } => match found {
                Value::String(s) => s.contains(value.as_str()),
                Value::Array(items) => items.iter().any(|v| v.as_str() == Some(value.as_str())),
                _ => false,
            },
            MatchRule::Matches { pattern, .. } => {
                let Some(text) = found.as_str() else {
                    return false;
                };
                regex::Regex::new(pattern)
                    .map(|re| re.is_match(text))
                    .unwrap_or(false)
            }
        }
    }
}

/// Walk `a.b.0.c` through objects and arrays.
pub fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(payload, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// `*` matches any run of characters, dots included.
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;
    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            resume = ti;
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            resume += 1;
            ti = resume;
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_type: String,
    #[serde(default)]
    pub rules: Vec<MatchRule>,
}

impl EventFilter {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: MatchRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn matches(&self, event: &BusEvent) -> bool {
        glob_matches(&self.event_type, &event.event_type)
            && self.rules.iter().all(|r| r.evaluate(&event.payload))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    pub id: String,
    pub event_type: String,
    pub payload: Value,
    pub ts: i64,
}

impl BusEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            payload,
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }
}

pub type EventHandler =
    Arc<dyn Fn(BusEvent) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> EventHandler
where
    F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(
        move |event: BusEvent| -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
            Box::pin(f(event))
        },
    )
}

/// Deregistration handle returned by [`EventBus::on`].
pub struct Unsubscribe(Option<Box<dyn FnOnce() + Send + Sync>>);

impl Unsubscribe {
    pub fn new(f: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub fn unsubscribe(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("armed", &self.0.is_some())
            .finish()
    }
}

pub trait EventBus: Send + Sync {
    fn on(&self, filter: EventFilter, handler: EventHandler) -> Unsubscribe;
}

struct Registered {
    id: u64,
    filter: EventFilter,
    handler: EventHandler,
}

/// In-process bus. Each matching handler runs on its own task so a slow
/// subscriber never holds up the publisher.
#[derive(Clone, Default)]
pub struct LocalEventBus {
    subscribers: Arc<Mutex<Vec<Registered>>>,
    next_id: Arc<AtomicU64>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver to every matching subscriber; returns how many matched.
    pub fn publish(&self, event: BusEvent) -> usize {
        let handlers: Vec<EventHandler> = match self.subscribers.lock() {
            Ok(subs) => subs
                .iter()
                .filter(|s| s.filter.matches(&event))
                .map(|s| s.handler.clone())
                .collect(),
            Err(_) => {
                warn!("Event bus subscriber list poisoned, dropping {}", event.event_type);
                return 0;
            }
        };
        debug!("Event {} matched {} subscriber(s)", event.event_type, handlers.len());
        for handler in &handlers {
            tokio::spawn(handler(event.clone()));
        }
        handlers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl EventBus for LocalEventBus {
    fn on(&self, filter: EventFilter, handler: EventHandler) -> Unsubscribe {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(Registered {
                id,
                filter,
                handler,
            });
        }
        let subscribers = self.subscribers.clone();
        Unsubscribe::new(move || {
            if let Ok(mut subs) = subscribers.lock() {
                subs.retain(|s| s.id != id);
            }
        })
    }
}
