use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use dashmap::DashMap;
use histguard_history::unix_now;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use stateful_adapter::{ResourceHandler, ResourceOutcome, ResourceRequest};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub created_at: f64,
}

/// In-memory event table shared by the event handlers.
#[derive(Clone, Default)]
pub struct EventStore {
    events: Arc<DashMap<String, Event>>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, title: impl Into<String>, owner: Option<String>) -> Event {
        let event = Event {
            id: format!("evt-{}", Uuid::new_v4().simple()),
            title: title.into(),
            owner,
            created_at: unix_now(),
        };
        self.events.insert(event.id.clone(), event.clone());
        event
    }

    pub fn insert(&self, event: Event) {
        self.events.insert(event.id.clone(), event);
    }

    pub fn get(&self, id: &str) -> Option<Event> {
        self.events.get(id).map(|event| event.clone())
    }

    pub fn remove(&self, id: &str) -> Option<Event> {
        self.events.remove(id).map(|(_, event)| event)
    }

    pub fn list(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self.events.iter().map(|entry| entry.value().clone()).collect();
        events.sort_by(|a, b| a.id.cmp(&b.id));
        events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

fn to_json(event: &Event) -> Value {
    serde_json::to_value(event).unwrap_or(Value::Null)
}

fn not_allowed(method: &Method) -> ResourceOutcome {
    ResourceOutcome::error(
        StatusCode::METHOD_NOT_ALLOWED,
        format!("{method} is not supported here"),
    )
}

/// `POST /api/events` creates, `GET /api/events` lists.
pub struct EventsCollection {
    store: EventStore,
}

impl EventsCollection {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ResourceHandler for EventsCollection {
    async fn handle(&self, request: ResourceRequest<'_>) -> ResourceOutcome {
        match *request.method {
            Method::POST => {
                let Some(title) = request
                    .body
                    .and_then(|body| body.get("title"))
                    .and_then(Value::as_str)
                else {
                    return ResourceOutcome::error(StatusCode::BAD_REQUEST, "`title` is required");
                };
                let event = self.store.create(title, request.token.user_id.clone());
                let id = event.id.clone();
                ResourceOutcome::created(to_json(&event), id)
            }
            Method::GET => {
                let events: Vec<Value> = self.store.list().iter().map(to_json).collect();
                ResourceOutcome::ok(json!({ "events": events }))
            }
            ref other => not_allowed(other),
        }
    }
}

/// `GET` and `DELETE` on `/api/events/{id}`.
pub struct EventItem {
    store: EventStore,
}

impl EventItem {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ResourceHandler for EventItem {
    async fn handle(&self, request: ResourceRequest<'_>) -> ResourceOutcome {
        let Some(id) = request.path_object_id else {
            return ResourceOutcome::error(StatusCode::BAD_REQUEST, "missing event id");
        };
        match *request.method {
            Method::GET => match self.store.get(id) {
                Some(event) => ResourceOutcome::ok(to_json(&event)),
                None => ResourceOutcome::error(StatusCode::NOT_FOUND, format!("no event `{id}`")),
            },
            Method::DELETE => match self.store.remove(id) {
                Some(_) => ResourceOutcome::ok(json!({ "deleted": id })),
                None => ResourceOutcome::error(StatusCode::NOT_FOUND, format!("no event `{id}`")),
            },
            ref other => not_allowed(other),
        }
    }
}

/// `POST /api/events/batch` with `{"ids": [...]}` reads several events.
pub struct EventsBatch {
    store: EventStore,
}

impl EventsBatch {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ResourceHandler for EventsBatch {
    async fn handle(&self, request: ResourceRequest<'_>) -> ResourceOutcome {
        if *request.method != Method::POST {
            return not_allowed(request.method);
        }
        if request.object_ids.is_empty() {
            return ResourceOutcome::error(StatusCode::BAD_REQUEST, "`ids` must not be empty");
        }
        let mut events = Vec::with_capacity(request.object_ids.len());
        for id in request.object_ids {
            match self.store.get(id) {
                Some(event) => events.push(to_json(&event)),
                None => {
                    return ResourceOutcome::error(StatusCode::NOT_FOUND, format!("no event `{id}`"))
                }
            }
        }
        ResourceOutcome::ok(json!({ "events": events }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_events_are_listed_in_id_order() {
        let store = EventStore::new();
        let a = store.create("a", None);
        let b = store.create("b", Some("alice".into()));
        assert!(a.id.starts_with("evt-"));
        assert_ne!(a.id, b.id);
        let ids: Vec<String> = store.list().into_iter().map(|e| e.id).collect();
        let mut expected = vec![a.id.clone(), b.id.clone()];
        expected.sort();
        assert_eq!(ids, expected);
        assert_eq!(store.remove(&a.id).unwrap().title, "a");
        assert_eq!(store.len(), 1);
    }
}
