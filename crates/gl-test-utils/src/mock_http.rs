//! Recording HTTP poster for webhook tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use link_core::upload::{HttpError, HttpPoster};

/// One captured POST.
#[derive(Debug, Clone)]
pub struct CapturedPost {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Records POSTs and answers with a scripted status.
pub struct MockPoster {
    posts: Mutex<Vec<CapturedPost>>,
    status: Mutex<u16>,
}

impl MockPoster {
    pub fn ok() -> Arc<MockPoster> {
        Arc::new(MockPoster {
            posts: Mutex::new(Vec::new()),
            status: Mutex::new(200),
        })
    }

    pub fn failing(status: u16) -> Arc<MockPoster> {
        Arc::new(MockPoster {
            posts: Mutex::new(Vec::new()),
            status: Mutex::new(status),
        })
    }

    pub fn set_status(&self, status: u16) {
        *self.status.lock().expect("status mutex") = status;
    }

    pub fn posts(&self) -> Vec<CapturedPost> {
        self.posts.lock().expect("posts mutex").clone()
    }
}

#[async_trait]
impl HttpPoster for MockPoster {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<u16, HttpError> {
        self.posts.lock().expect("posts mutex").push(CapturedPost {
            url: url.to_owned(),
            headers: headers.to_vec(),
            body,
        });
        let status = *self.status.lock().expect("status mutex");
        if (200..300).contains(&status) {
            Ok(status)
        } else {
            Err(HttpError::Status(status))
        }
    }
}
