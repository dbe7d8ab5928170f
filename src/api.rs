use crate::kind::ImageKind;
use std::io;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ApiError {
    /// A 404 outside of an explicit existence check.
    #[error("not found: {what}")]
    NotFound { what: String },
    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// One image as returned by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteImage {
    pub index: usize,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Image operations the normalizer needs from the media server. Entities are
/// identified by an opaque id; profile images use the user id.
pub trait ImageApi {
    fn fetch_image_at(
        &self,
        entity_id: &str,
        kind: ImageKind,
        index: usize,
    ) -> Result<RemoteImage, ApiError>;

    /// Number of images the entity currently owns for `kind`.
    fn count_images(&self, entity_id: &str, kind: ImageKind) -> Result<usize, ApiError>;

    fn upload_image(
        &self,
        entity_id: &str,
        kind: ImageKind,
        index: usize,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), ApiError>;

    fn delete_image(&self, entity_id: &str, kind: ImageKind, index: usize)
        -> Result<(), ApiError>;

    /// Existence check. A 404 is `Ok(false)` here and nowhere else.
    fn head_image(
        &self,
        entity_id: &str,
        kind: ImageKind,
        index: usize,
        retry: bool,
    ) -> Result<bool, ApiError>;

    /// True when mutating calls are simulated.
    fn dry_run(&self) -> bool {
        false
    }

    fn fetch_image(&self, entity_id: &str, kind: ImageKind) -> Result<RemoteImage, ApiError> {
        self.fetch_image_at(entity_id, kind, 0)
    }

    /// All images of `kind`, in index order.
    fn fetch_all_images(
        &self,
        entity_id: &str,
        kind: ImageKind,
    ) -> Result<Vec<RemoteImage>, ApiError> {
        let count = self.count_images(entity_id, kind)?;
        (0..count)
            .map(|index| self.fetch_image_at(entity_id, kind, index))
            .collect()
    }
}

impl<T: ImageApi + ?Sized> ImageApi for &T {
    fn fetch_image_at(
        &self,
        entity_id: &str,
        kind: ImageKind,
        index: usize,
    ) -> Result<RemoteImage, ApiError> {
        (**self).fetch_image_at(entity_id, kind, index)
    }

    fn count_images(&self, entity_id: &str, kind: ImageKind) -> Result<usize, ApiError> {
        (**self).count_images(entity_id, kind)
    }

    fn upload_image(
        &self,
        entity_id: &str,
        kind: ImageKind,
        index: usize,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), ApiError> {
        (**self).upload_image(entity_id, kind, index, bytes, content_type)
    }

    fn delete_image(
        &self,
        entity_id: &str,
        kind: ImageKind,
        index: usize,
    ) -> Result<(), ApiError> {
        (**self).delete_image(entity_id, kind, index)
    }

    fn head_image(
        &self,
        entity_id: &str,
        kind: ImageKind,
        index: usize,
        retry: bool,
    ) -> Result<bool, ApiError> {
        (**self).head_image(entity_id, kind, index, retry)
    }

    fn dry_run(&self) -> bool {
        (**self).dry_run()
    }
}

/// Dry-run switch for mutating calls. Reads always reach the inner API;
/// writes are logged and reported as successful without being sent.
#[derive(Debug)]
pub struct WriteGate<A> {
    inner: A,
    dry_run: bool,
}

impl<A> WriteGate<A> {
    pub fn new(inner: A, dry_run: bool) -> Self {
        Self { inner, dry_run }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }
}

impl<A: ImageApi> ImageApi for WriteGate<A> {
    fn fetch_image_at(
        &self,
        entity_id: &str,
        kind: ImageKind,
        index: usize,
    ) -> Result<RemoteImage, ApiError> {
        self.inner.fetch_image_at(entity_id, kind, index)
    }

    fn count_images(&self, entity_id: &str, kind: ImageKind) -> Result<usize, ApiError> {
        self.inner.count_images(entity_id, kind)
    }

    fn upload_image(
        &self,
        entity_id: &str,
        kind: ImageKind,
        index: usize,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), ApiError> {
        if self.dry_run {
            info!(
                "DRY RUN - Would upload {} image #{} for {} ({} bytes, {}).",
                kind.api_name(),
                index,
                entity_id,
                bytes.len(),
                content_type
            );
            return Ok(());
        }
        self.inner
            .upload_image(entity_id, kind, index, bytes, content_type)
    }

    fn delete_image(
        &self,
        entity_id: &str,
        kind: ImageKind,
        index: usize,
    ) -> Result<(), ApiError> {
        if self.dry_run {
            info!(
                "DRY RUN - Would delete {} image #{} for {}.",
                kind.api_name(),
                index,
                entity_id
            );
            return Ok(());
        }
        self.inner.delete_image(entity_id, kind, index)
    }

    fn head_image(
        &self,
        entity_id: &str,
        kind: ImageKind,
        index: usize,
        retry: bool,
    ) -> Result<bool, ApiError> {
        self.inner.head_image(entity_id, kind, index, retry)
    }

    fn dry_run(&self) -> bool {
        self.dry_run
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeApi;
    use super::*;

    #[test]
    fn write_gate_blocks_mutations_in_dry_run() {
        let api = FakeApi::with_images("e1", ImageKind::Logo, vec![(b"x".to_vec(), "image/png")]);
        let gate = WriteGate::new(&api, true);
        assert!(gate.dry_run());
        gate.upload_image("e1", ImageKind::Logo, 0, b"y", "image/png")
            .unwrap();
        gate.delete_image("e1", ImageKind::Logo, 0).unwrap();
        assert_eq!(api.mutations(), 0);
        assert_eq!(gate.fetch_image("e1", ImageKind::Logo).unwrap().bytes, b"x");
    }

    #[test]
    fn write_gate_forwards_when_live() {
        let api = FakeApi::default();
        let gate = WriteGate::new(&api, false);
        assert!(!gate.dry_run());
        gate.upload_image("e1", ImageKind::Thumb, 0, b"y", "image/jpeg")
            .unwrap();
        assert_eq!(api.uploads.borrow().len(), 1);
    }

    #[test]
    fn fetch_all_returns_images_in_order() {
        let api = FakeApi::with_images(
            "e1",
            ImageKind::Backdrop,
            vec![(b"a".to_vec(), "image/jpeg"), (b"b".to_vec(), "image/png")],
        );
        let all = api.fetch_all_images("e1", ImageKind::Backdrop).unwrap();
        assert_eq!(all.iter().map(|i| i.index).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(all[1].content_type, "image/png");
        assert!(matches!(
            api.fetch_image("missing", ImageKind::Logo),
            Err(ApiError::NotFound { .. })
        ));
    }
}
