//! Runtime subscription state: definitions paired with compiled filters.
//!
//! Filter patterns compile to regexes once when a subscription is
//! loaded; the compiled form is cached alongside the snapshot and
//! rebuilt only when the stored definition changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use regex::Regex;

use ledgermesh_core::filter::Filter;
use ledgermesh_core::store::{Database, StoreError};
use ledgermesh_core::types::{Event, MessageHeader, Subscription, SubscriptionFilter};

use crate::transport::CallbackError;

/// A subscription's filter patterns, compiled. `None` means match-all.
#[derive(Debug)]
pub struct CompiledFilter {
    events: Option<Regex>,
    topic: Option<Regex>,
    context: Option<Regex>,
    group: Option<Regex>,
}

fn compile_pattern(pattern: &str) -> Result<Option<Regex>, CallbackError> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|e| CallbackError::InvalidFilter {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

impl CompiledFilter {
    /// Compiles all patterns of a filter.
    ///
    /// # Errors
    ///
    /// Returns the first pattern that fails to compile.
    pub fn compile(filter: &SubscriptionFilter) -> Result<Self, CallbackError> {
        Ok(Self {
            events: compile_pattern(&filter.events)?,
            topic: compile_pattern(&filter.topic)?,
            context: compile_pattern(&filter.context)?,
            group: compile_pattern(&filter.group)?,
        })
    }

    /// Whether the `events` pattern admits this event's type.
    #[must_use]
    pub fn matches_event(&self, event: &Event) -> bool {
        self.events
            .as_ref()
            .map_or(true, |re| re.is_match(event.event_type.as_str()))
    }

    /// Whether the message-field patterns admit the referenced message.
    /// When both `topic` and `group` are set, both must match.
    #[must_use]
    pub fn matches_message(&self, header: &MessageHeader) -> bool {
        self.topic.as_ref().map_or(true, |re| re.is_match(&header.topic))
            && self
                .context
                .as_ref()
                .map_or(true, |re| re.is_match(&header.context))
            && self
                .group
                .as_ref()
                .map_or(true, |re| re.is_match(header.group.as_deref().unwrap_or("")))
    }

    /// True when no message-field pattern is set, so the referenced
    /// message never needs loading.
    #[must_use]
    pub fn message_blind(&self) -> bool {
        self.topic.is_none() && self.context.is_none() && self.group.is_none()
    }
}

/// A subscription snapshot paired with its compiled filter.
#[derive(Debug)]
pub struct RuntimeSubscription {
    pub definition: Subscription,
    pub compiled: CompiledFilter,
}

impl RuntimeSubscription {
    /// Compiles a definition into runtime form.
    ///
    /// # Errors
    ///
    /// Returns the first filter pattern that fails to compile.
    pub fn compile(definition: Subscription) -> Result<Arc<Self>, CallbackError> {
        let compiled = CompiledFilter::compile(&definition.filter)?;
        Ok(Arc::new(Self {
            definition,
            compiled,
        }))
    }
}

/// Loads durable subscriptions and caches their compiled form.
pub struct SubscriptionRegistry {
    database: Arc<dyn Database>,
    cache: Mutex<HashMap<(String, String), Arc<RuntimeSubscription>>>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new(database: Arc<dyn Database>) -> Self {
        Self {
            database,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Loads every durable subscription, reusing cached compiled filters
    /// for unchanged definitions and dropping cache entries whose rows
    /// are gone. Subscriptions whose patterns no longer compile are
    /// skipped with a log line rather than wedging the poller.
    ///
    /// # Errors
    ///
    /// Returns a storage error; the caller treats it as transient.
    pub fn load_all(&self) -> Result<Vec<Arc<RuntimeSubscription>>, StoreError> {
        let stored = self.database.get_subscriptions(&Filter::default())?;
        let mut cache = self.cache.lock().unwrap();

        let mut fresh = HashMap::with_capacity(stored.len());
        let mut loaded = Vec::with_capacity(stored.len());
        for definition in stored {
            let key = (definition.namespace.clone(), definition.name.clone());
            let runtime = match cache.get(&key) {
                Some(cached) if cached.definition == definition => Arc::clone(cached),
                _ => match RuntimeSubscription::compile(definition) {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!(
                            namespace = %key.0,
                            name = %key.1,
                            error = %e,
                            "skipping subscription with invalid filter"
                        );
                        continue;
                    }
                },
            };
            fresh.insert(key, Arc::clone(&runtime));
            loaded.push(runtime);
        }
        *cache = fresh;
        Ok(loaded)
    }
}
