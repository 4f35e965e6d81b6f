//! Service endpoint registry with round-robin selection and cooldown eviction

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::coordinator::model::{AssignmentStatus, Service};

pub struct EndpointRegistry {
    cooldown: Duration,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Keyed by both service id and service name
    routes: HashMap<String, Vec<String>>,
    cursors: HashMap<String, usize>,
    ejected: HashMap<String, Instant>,
}

impl EndpointRegistry {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Rebuild the route map from the coordinator's service list
    pub fn update(&self, services: &[Service]) {
        let mut routes: HashMap<String, Vec<String>> = HashMap::new();
        for service in services {
            let endpoints: Vec<String> = service
                .assignments
                .iter()
                .filter(|a| a.status == AssignmentStatus::Running)
                .filter_map(|a| a.endpoint.clone())
                .collect();
            if endpoints.is_empty() {
                continue;
            }
            routes.insert(service.id.clone(), endpoints.clone());
            routes
                .entry(service.name.clone())
                .or_default()
                .extend(endpoints);
        }
        let mut inner = self.inner.lock().expect("registry lock");
        inner.routes = routes;
    }

    /// Round-robin pick of a healthy endpoint for the service key
    pub fn select(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().expect("registry lock");
        let endpoints = inner.routes.get(key)?.clone();
        if endpoints.is_empty() {
            return None;
        }
        let cursor = inner.cursors.entry(key.to_string()).or_insert(0);
        let start = *cursor;
        *cursor = (*cursor + 1) % endpoints.len();
        let now = Instant::now();
        for offset in 0..endpoints.len() {
            let endpoint = &endpoints[(start + offset) % endpoints.len()];
            let healthy = match inner.ejected.get(endpoint) {
                Some(at) => now.duration_since(*at) >= self.cooldown,
                None => true,
            };
            if healthy {
                return Some(endpoint.clone());
            }
        }
        None
    }

    /// Take an endpoint out of rotation for the cooldown window
    pub fn eject(&self, endpoint: &str) {
        let mut inner = self.inner.lock().expect("registry lock");
        inner.ejected.insert(endpoint.to_string(), Instant::now());
    }

    pub fn mark_healthy(&self, endpoint: &str) {
        let mut inner = self.inner.lock().expect("registry lock");
        inner.ejected.remove(endpoint);
    }

    /// Every distinct endpoint currently routed, for the health prober
    pub fn endpoints(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("registry lock");
        let mut endpoints: Vec<String> = inner.routes.values().flatten().cloned().collect();
        endpoints.sort();
        endpoints.dedup();
        endpoints
    }
}
