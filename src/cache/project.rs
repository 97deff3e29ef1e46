//! Project request/response store
//!
//! Maps dumped request bytes to the serialized response observed for them.
//! Executors consult it before the network and fill it exactly once after
//! the first successful call for a request.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::http::client::ResponseHop;

/// A stored response, sufficient to rebuild a response hop.
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub status: u16,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub url: String,
}

impl From<&ResponseHop> for StoredResponse {
    fn from(hop: &ResponseHop) -> Self {
        Self {
            status: hop.status,
            version: hop.version.clone(),
            headers: hop.headers.clone(),
            body: hop.body.clone(),
            url: hop.url.clone(),
        }
    }
}

impl StoredResponse {
    pub fn to_hop(&self) -> ResponseHop {
        ResponseHop {
            status: self.status,
            version: self.version.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            url: self.url.clone(),
            truncated: false,
        }
    }
}

#[derive(Default)]
pub struct ProjectFile {
    entries: Mutex<HashMap<Vec<u8>, StoredResponse>>,
}

impl ProjectFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the response cached for a dumped request.
    pub fn get(&self, dumped_request: &[u8]) -> Option<StoredResponse> {
        self.entries
            .lock()
            .expect("project file poisoned")
            .get(dumped_request)
            .cloned()
    }

    /// Persists a response for a dumped request. The first fill wins;
    /// subsequent calls for the same key are no-ops.
    pub fn set(&self, dumped_request: &[u8], response: StoredResponse) {
        self.entries
            .lock()
            .expect("project file poisoned")
            .entry(dumped_request.to_vec())
            .or_insert(response);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("project file poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &str) -> StoredResponse {
        StoredResponse {
            status: 200,
            version: "HTTP/1.1".into(),
            headers: vec![],
            body: body.into(),
            url: "http://example.com/".into(),
        }
    }

    #[test]
    fn first_fill_wins() {
        let project = ProjectFile::new();
        project.set(b"GET / HTTP/1.1", response("first"));
        project.set(b"GET / HTTP/1.1", response("second"));
        assert_eq!(project.get(b"GET / HTTP/1.1").expect("hit").body, "first");
        assert_eq!(project.len(), 1);
    }

    #[test]
    fn miss_returns_none() {
        let project = ProjectFile::new();
        assert!(project.get(b"GET /other HTTP/1.1").is_none());
    }
}
