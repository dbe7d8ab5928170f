use crate::api::ApiError;
use crate::kind::ImageKind;
use crate::stats::RunStats;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use thiserror::Error;
use tracing::{error, info};

pub const PAGE_SIZE: usize = 200;
const ALLOWED_COLLECTION_TYPES: [&str; 3] = ["movies", "tvshows", "mixed"];

lazy_static! {
    static ref NON_ALNUM: Regex = Regex::new(r"[^a-z0-9]+").unwrap();
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UserDto {
    pub id: String,
    pub name: String,
    pub primary_image_tag: Option<String>,
}

impl UserDto {
    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.id)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ItemDto {
    pub id: String,
    pub name: String,
    #[serde(rename = "Type")]
    pub item_type: String,
    pub collection_type: Option<String>,
    pub parent_id: Option<String>,
    pub image_tags: HashMap<String, String>,
    pub backdrop_image_tags: Vec<String>,
}

impl ItemDto {
    /// Number of images of `kind` the item reports.
    pub fn image_count(&self, kind: ImageKind) -> usize {
        if kind.is_ordered() {
            self.backdrop_image_tags.len()
        } else {
            usize::from(self.image_tags.contains_key(kind.api_name()))
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ItemsPage {
    pub items: Vec<ItemDto>,
    pub total_record_count: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ItemQuery<'a> {
    pub parent_id: &'a str,
    pub include_item_types: &'a [String],
    pub enable_image_types: &'a [&'static str],
    pub start_index: usize,
    pub limit: usize,
}

/// Read-only server listing calls used to find work.
pub trait Catalog {
    /// Active (not disabled) users.
    fn list_users(&self) -> Result<Vec<UserDto>, ApiError>;
    /// Top-level views visible to `user_id`.
    fn list_libraries(&self, user_id: &str) -> Result<Vec<ItemDto>, ApiError>;
    fn query_items(&self, user_id: &str, query: &ItemQuery<'_>) -> Result<ItemsPage, ApiError>;
    fn get_item(&self, item_id: &str) -> Result<ItemDto, ApiError>;
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("no active users returned by the server")]
    NoActiveUsers,
    #[error("user '{0}' not found among active users")]
    UserNotFound(String),
    #[error("library filters ({0}) matched no library")]
    NoLibraryMatch(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Library {
    pub id: String,
    pub name: String,
    pub collection_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredItem {
    pub id: String,
    pub name: String,
    pub item_type: String,
    pub kinds: BTreeSet<ImageKind>,
    pub backdrop_count: usize,
}

impl DiscoveredItem {
    pub fn from_dto(dto: &ItemDto, wanted: &[ImageKind]) -> Self {
        Self {
            id: dto.id.clone(),
            name: if dto.name.is_empty() {
                "<unknown>".into()
            } else {
                dto.name.clone()
            },
            item_type: if dto.item_type.is_empty() {
                "Item".into()
            } else {
                dto.item_type.clone()
            },
            kinds: wanted
                .iter()
                .copied()
                .filter(|kind| dto.image_count(*kind) > 0)
                .collect(),
            backdrop_count: dto.backdrop_image_tags.len(),
        }
    }

    /// Images that processing `kind` will touch.
    pub fn image_count(&self, kind: ImageKind) -> usize {
        if kind.is_ordered() {
            self.backdrop_count.max(1)
        } else {
            1
        }
    }

    pub fn label(&self, kind: ImageKind) -> String {
        format!("{} ({}) [{}]", self.name, self.item_type, kind.api_name())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    pub library_names: Vec<String>,
    pub item_types: Vec<String>,
    pub kinds: Vec<ImageKind>,
}

/// Case-folds and strips everything but ASCII letters and digits, so
/// "🎬 | Movies" and "movies" compare equal.
pub fn normalize_library_name(name: &str) -> String {
    NON_ALNUM.replace_all(&name.to_lowercase(), "").into_owned()
}

pub fn find_user_by_name<'a>(users: &'a [UserDto], username: &str) -> Option<&'a UserDto> {
    let wanted = username.to_lowercase();
    users.iter().find(|user| user.name.to_lowercase() == wanted)
}

/// The configured operator, or the first active user.
pub fn resolve_operator<C: Catalog + ?Sized>(
    catalog: &C,
    username: Option<&str>,
) -> Result<UserDto, DiscoveryError> {
    let users = catalog.list_users()?;
    if users.is_empty() {
        return Err(DiscoveryError::NoActiveUsers);
    }
    match username {
        Some(name) => find_user_by_name(&users, name)
            .cloned()
            .ok_or_else(|| DiscoveryError::UserNotFound(name.to_string())),
        None => {
            info!("Operator not specified; defaulting to first active user.");
            Ok(users[0].clone())
        }
    }
}

pub fn discover_libraries<C: Catalog + ?Sized>(
    catalog: &C,
    user_id: &str,
    filter: &DiscoveryFilter,
) -> Result<Vec<Library>, DiscoveryError> {
    let views = catalog.list_libraries(user_id)?;
    let names: HashSet<String> = filter
        .library_names
        .iter()
        .map(|n| normalize_library_name(n))
        .collect();
    if !names.is_empty() {
        let mut sorted: Vec<_> = names.iter().cloned().collect();
        sorted.sort();
        info!(
            "Library filter configured: raw={:?} normalized={:?}",
            filter.library_names, sorted
        );
    }

    let libraries: Vec<Library> = views
        .iter()
        .filter(|view| !view.id.is_empty())
        .filter(|view| names.is_empty() || names.contains(&normalize_library_name(&view.name)))
        .filter_map(|view| {
            let collection_type = view.collection_type.as_ref().map(|c| c.to_lowercase());
            match collection_type.as_deref() {
                Some(ct) if !ALLOWED_COLLECTION_TYPES.contains(&ct) => None,
                _ => Some(Library {
                    id: view.id.clone(),
                    name: view.name.clone(),
                    collection_type,
                }),
            }
        })
        .collect();

    if !names.is_empty() && libraries.is_empty() {
        return Err(DiscoveryError::NoLibraryMatch(filter.library_names.join(", ")));
    }
    info!(
        "Discovered {} libraries for user {} ({} visible).",
        libraries.len(),
        user_id,
        views.len()
    );
    Ok(libraries)
}

/// Pages through a library and keeps items carrying at least one wanted
/// kind. A failed page is recorded as an error and ends the scan of that
/// library.
pub fn discover_items<C: Catalog + ?Sized>(
    catalog: &C,
    user_id: &str,
    library: &Library,
    filter: &DiscoveryFilter,
    stats: &mut RunStats,
) -> Vec<DiscoveredItem> {
    let wanted: Vec<ImageKind> = filter
        .kinds
        .iter()
        .copied()
        .filter(|k| *k != ImageKind::Profile)
        .collect();
    if wanted.is_empty() {
        return Vec::new();
    }
    let api_names: Vec<&'static str> = wanted.iter().map(|k| k.api_name()).collect();
    info!(
        "Scanning library '{}' for image types {} (page_size={})",
        library.name,
        api_names.join(","),
        PAGE_SIZE
    );

    let mut found: BTreeMap<String, DiscoveredItem> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut start_index = 0;
    loop {
        let query = ItemQuery {
            parent_id: &library.id,
            include_item_types: &filter.item_types,
            enable_image_types: &api_names,
            start_index,
            limit: PAGE_SIZE,
        };
        let page = match catalog.query_items(user_id, &query) {
            Ok(page) => page,
            Err(e) => {
                error!(
                    "[API-ERROR] Failed to query items in '{}' (start {}): {}",
                    library.name, start_index, e
                );
                stats.record_error(
                    library.name.clone(),
                    format!("item query failed at start {}: {}", start_index, e),
                );
                break;
            }
        };

        let fetched = page.items.len();
        for dto in &page.items {
            if dto.id.is_empty() {
                continue;
            }
            let item = DiscoveredItem::from_dto(dto, &wanted);
            if item.kinds.is_empty() {
                continue;
            }
            match found.get_mut(&item.id) {
                Some(existing) => existing.kinds.extend(item.kinds),
                None => {
                    order.push(item.id.clone());
                    found.insert(item.id.clone(), item);
                }
            }
        }
        info!(
            "Library '{}': fetched {} items (start={}), unique with target images so far: {}",
            library.name,
            fetched,
            start_index,
            found.len()
        );

        if fetched == 0 {
            break;
        }
        start_index += fetched;
        match page.total_record_count {
            Some(total) if start_index >= total => break,
            None if fetched < PAGE_SIZE => break,
            _ => {}
        }
    }

    order
        .into_iter()
        .filter_map(|id| found.remove(&id))
        .collect()
}
