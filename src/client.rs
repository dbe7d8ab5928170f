use crate::api::{ApiError, ImageApi, RemoteImage};
use crate::discovery::{Catalog, ItemDto, ItemQuery, ItemsPage, UserDto};
use crate::kind::ImageKind;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use std::io::Read;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

const ERROR_SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    /// Pause after every successful upload or delete.
    pub write_delay: Duration,
    pub retry_count: u32,
    pub retry_backoff: Duration,
}

/// Blocking Jellyfin client. Every request carries the API token and goes
/// through the same retry loop; only existence checks may opt out of it.
#[derive(Debug, Clone)]
pub struct JellyfinClient {
    agent: ureq::Agent,
    settings: ClientSettings,
}

enum Method {
    Get,
    Head,
    Post,
    Delete,
}

impl Method {
    fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

impl JellyfinClient {
    pub fn new(mut settings: ClientSettings) -> Self {
        settings.base_url = settings.base_url.trim_end_matches('/').to_string();
        let agent = ureq::AgentBuilder::new().timeout(settings.timeout).build();
        Self { agent, settings }
    }

    pub fn base_url(&self) -> &str {
        &self.settings.base_url
    }

    /// Preflight: token and connectivity check against `/System/Info`.
    pub fn test_connection(&self) -> Result<(), ApiError> {
        self.send(Method::Get, "/System/Info", &[], None, "system info", true)?;
        info!("[API-TEST] Jellyfin connection OK.");
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> Result<UserDto, ApiError> {
        self.get_json(&format!("/Users/{}", user_id), &[], &format!("user {}", user_id))
    }

    fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<(&[u8], &str)>,
        label: &str,
        retry: bool,
    ) -> Result<ureq::Response, ApiError> {
        let url = format!("{}{}", self.settings.base_url, path);
        let attempts = if retry {
            self.settings.retry_count.max(1)
        } else {
            1
        };
        // Encoded once; the server expects base64 image bodies.
        let encoded = body.map(|(data, content_type)| (BASE64.encode(data), content_type));
        let mut backoff = self.settings.retry_backoff;
        let mut last_error = ApiError::Transport("request was not attempted".into());

        for attempt in 1..=attempts {
            let mut request = self
                .agent
                .request(method.as_str(), &url)
                .set("X-Emby-Token", &self.settings.api_key);
            for (key, value) in query {
                request = request.query(key, value);
            }
            let result = match &encoded {
                Some((payload, content_type)) => request
                    .set("Content-Type", content_type)
                    .send_string(payload),
                None => request.call(),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(ureq::Error::Status(404, _)) => {
                    return Err(ApiError::NotFound {
                        what: label.to_string(),
                    })
                }
                Err(ureq::Error::Status(code, response)) => {
                    let body = snippet(&response.into_string().unwrap_or_default());
                    last_error = ApiError::Status { code, body };
                    if !is_retryable(code) {
                        error!("[API-ERROR] {} failed for {}: {}", method.as_str(), label, last_error);
                        return Err(last_error);
                    }
                }
                Err(ureq::Error::Transport(transport)) => {
                    last_error = ApiError::Transport(transport.to_string());
                }
            }

            error!(
                "[API-ERROR] Attempt {}/{} failed for {}: {}",
                attempt, attempts, label, last_error
            );
            if attempt < attempts && !backoff.is_zero() {
                thread::sleep(backoff);
                backoff *= 2;
            }
        }
        Err(last_error)
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        label: &str,
    ) -> Result<T, ApiError> {
        let response = self.send(Method::Get, path, query, None, label, true)?;
        Ok(serde_json::from_reader(response.into_reader())?)
    }

    fn after_write(&self, what: &str) {
        info!("[API] {}", what);
        if !self.settings.write_delay.is_zero() {
            thread::sleep(self.settings.write_delay);
        }
    }
}

/// Path and query addressing one image. Profile images live on the user.
fn image_target(entity_id: &str, kind: ImageKind, index: usize) -> (String, Vec<(&'static str, String)>) {
    match kind {
        ImageKind::Profile => ("/UserImage".to_string(), vec![("userId", entity_id.to_string())]),
        kind if kind.is_ordered() => (
            format!("/Items/{}/Images/{}/{}", entity_id, kind.api_name(), index),
            Vec::new(),
        ),
        kind => (
            format!("/Items/{}/Images/{}", entity_id, kind.api_name()),
            Vec::new(),
        ),
    }
}

fn image_label(entity_id: &str, kind: ImageKind, index: usize) -> String {
    if kind.is_ordered() {
        format!("item {} {} #{}", entity_id, kind.api_name(), index)
    } else if kind == ImageKind::Profile {
        format!("user {} profile image", entity_id)
    } else {
        format!("item {} {}", entity_id, kind.api_name())
    }
}

fn is_retryable(code: u16) -> bool {
    !(400..500).contains(&code) || code == 408 || code == 429
}

fn snippet(body: &str) -> String {
    body.chars()
        .take(ERROR_SNIPPET_CHARS)
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect()
}

impl ImageApi for JellyfinClient {
    fn fetch_image_at(
        &self,
        entity_id: &str,
        kind: ImageKind,
        index: usize,
    ) -> Result<RemoteImage, ApiError> {
        let (path, query) = image_target(entity_id, kind, index);
        let label = image_label(entity_id, kind, index);
        let response = self.send(Method::Get, &path, &query, None, &label, true)?;
        let content_type = response
            .header("Content-Type")
            .unwrap_or("application/octet-stream")
            .to_string();
        let mut bytes = Vec::new();
        response.into_reader().read_to_end(&mut bytes)?;
        debug!("  -> fetched {} ({} bytes, {})", label, bytes.len(), content_type);
        Ok(RemoteImage {
            index,
            bytes,
            content_type,
        })
    }

    fn count_images(&self, entity_id: &str, kind: ImageKind) -> Result<usize, ApiError> {
        if kind == ImageKind::Profile {
            let user = self.get_user(entity_id)?;
            return Ok(usize::from(user.primary_image_tag.is_some()));
        }
        Ok(self.get_item(entity_id)?.image_count(kind))
    }

    fn upload_image(
        &self,
        entity_id: &str,
        kind: ImageKind,
        index: usize,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), ApiError> {
        let (path, query) = image_target(entity_id, kind, index);
        let label = image_label(entity_id, kind, index);
        self.send(
            Method::Post,
            &path,
            &query,
            Some((bytes, content_type)),
            &label,
            true,
        )?;
        self.after_write(&format!("Updated {}", label));
        Ok(())
    }

    fn delete_image(
        &self,
        entity_id: &str,
        kind: ImageKind,
        index: usize,
    ) -> Result<(), ApiError> {
        let (path, query) = image_target(entity_id, kind, index);
        let label = image_label(entity_id, kind, index);
        self.send(Method::Delete, &path, &query, None, &label, true)?;
        self.after_write(&format!("Deleted {}", label));
        Ok(())
    }

    fn head_image(
        &self,
        entity_id: &str,
        kind: ImageKind,
        index: usize,
        retry: bool,
    ) -> Result<bool, ApiError> {
        let (path, query) = image_target(entity_id, kind, index);
        let label = image_label(entity_id, kind, index);
        match self.send(Method::Head, &path, &query, None, &label, retry) {
            Ok(_) => Ok(true),
            Err(ApiError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl Catalog for JellyfinClient {
    fn list_users(&self) -> Result<Vec<UserDto>, ApiError> {
        self.get_json("/Users", &[("isDisabled", "false".into())], "list users")
    }

    fn list_libraries(&self, user_id: &str) -> Result<Vec<ItemDto>, ApiError> {
        let page: ItemsPage = self.get_json(
            &format!("/Users/{}/Items", user_id),
            &[],
            &format!("libraries for user {}", user_id),
        )?;
        Ok(page.items)
    }

    fn query_items(&self, user_id: &str, query: &ItemQuery<'_>) -> Result<ItemsPage, ApiError> {
        let params = [
            ("ParentId", query.parent_id.to_string()),
            ("IncludeItemTypes", query.include_item_types.join(",")),
            ("Recursive", "true".to_string()),
            ("ImageTypeLimit", "1".to_string()),
            ("EnableImageTypes", query.enable_image_types.join(",")),
            ("StartIndex", query.start_index.to_string()),
            ("Limit", query.limit.to_string()),
        ];
        let label = format!(
            "items for user {} (parent={}, start={}, limit={})",
            user_id, query.parent_id, query.start_index, query.limit
        );
        self.get_json(&format!("/Users/{}/Items", user_id), &params, &label)
    }

    fn get_item(&self, item_id: &str) -> Result<ItemDto, ApiError> {
        let page: ItemsPage = self.get_json(
            "/Items",
            &[("ids", item_id.to_string())],
            &format!("item {}", item_id),
        )?;
        page.items
            .into_iter()
            .find(|item| item.id == item_id)
            .ok_or_else(|| ApiError::NotFound {
                what: format!("item {}", item_id),
            })
    }
}
