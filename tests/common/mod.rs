#![allow(dead_code)]

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use sqlx::SqlitePool;
use std::{io::Cursor, sync::Arc, time::Duration};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tripbasket_media::{
    db,
    models::optimization::FinalizeEvent,
    services::{
        document_service::DocumentService, signing::UrlSigner, storage_service::StorageService,
    },
};

pub const BUCKET: &str = "tripbasket-test";

/// Fresh database with the schema applied, plus a payload root.
pub struct Fixture {
    pub dir: TempDir,
    pub db: Arc<SqlitePool>,
    pub storage: StorageService,
    pub documents: DocumentService,
}

pub async fn fixture() -> Fixture {
    build(None, false).await
}

/// Like [`fixture`], backed by a database file so the pool has several
/// connections contending for the write lock.
pub async fn file_fixture() -> Fixture {
    build(None, true).await
}

/// Like [`fixture`], with finalize events delivered to the returned receiver.
pub async fn fixture_with_events() -> (Fixture, mpsc::Receiver<FinalizeEvent>) {
    let (tx, rx) = mpsc::channel(64);
    (build(Some(tx), false).await, rx)
}

async fn build(events: Option<mpsc::Sender<FinalizeEvent>>, on_disk: bool) -> Fixture {
    let dir = TempDir::new().expect("tempdir");
    let database_url = if on_disk {
        format!("sqlite://{}", dir.path().join("meta/media.db").display())
    } else {
        "sqlite::memory:".to_string()
    };
    let db = Arc::new(db::connect(&database_url).await.expect("connect"));
    db::run_migrations(&db).await.expect("migrate");

    let signer = UrlSigner::new("http://media.test", "test-secret").expect("signer");
    let mut storage = StorageService::new(db.clone(), dir.path(), signer);
    if let Some(tx) = events {
        storage = storage.with_finalize_events(tx);
    }
    storage.ensure_bucket(BUCKET).await.expect("bucket");
    let documents = DocumentService::new(db.clone());

    Fixture {
        dir,
        db,
        storage,
        documents,
    }
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 251) as u8, (y % 241) as u8, 90]));
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Png)
        .expect("encode png");
    buf.into_inner()
}

/// Poll `check` for up to about thirty seconds; image work is slow in debug builds.
pub async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..1500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
