use std::sync::Arc;

use snapgraph_core::collab::{RowSource, WriteSink};
use snapgraph_core::model::{row, EntityResolver, ObjectId, Value};
use snapgraph_core::policy::{SessionDelegate, ValidationHook};
use snapgraph_core::{CacheConfig, Runtime, RuntimeBuilder};
use snapgraph_store::sample::{
    art_gallery, ARTGROUP, ARTIST, ARTIST_EXHIBIT, EXHIBIT, GALLERY, PAINTING, PERSON,
};
use snapgraph_store::MemoryStorage;

/// Storage plus a runtime wired to it
pub struct Fixture {
    pub storage: MemoryStorage,
    pub runtime: Arc<Runtime>,
}

fn builder(storage: &MemoryStorage) -> RuntimeBuilder {
    let source: Arc<dyn RowSource> = Arc::new(storage.clone());
    let sink: Arc<dyn WriteSink> = Arc::new(storage.clone());
    Runtime::builder(Arc::clone(storage.resolver()), source, sink)
}

fn storage() -> MemoryStorage {
    let resolver: Arc<EntityResolver> = Arc::new(art_gallery().unwrap());
    MemoryStorage::new(resolver)
}

/// Fixture with default configuration and no hooks
#[allow(dead_code)]
pub fn fixture() -> Fixture {
    let storage = storage();
    let runtime = builder(&storage).build().unwrap();
    Fixture { storage, runtime }
}

#[allow(dead_code)]
pub fn fixture_with_config(config: CacheConfig) -> Fixture {
    let storage = storage();
    let runtime = builder(&storage).config(config).build().unwrap();
    Fixture { storage, runtime }
}

#[allow(dead_code)]
pub fn fixture_with_hook(hook: Arc<dyn ValidationHook>) -> Fixture {
    let storage = storage();
    let runtime = builder(&storage).validation_hook(hook).build().unwrap();
    Fixture { storage, runtime }
}

#[allow(dead_code)]
pub fn fixture_with_delegate(delegate: Arc<dyn SessionDelegate>) -> Fixture {
    let storage = storage();
    let runtime = builder(&storage).delegate(delegate).build().unwrap();
    Fixture { storage, runtime }
}

#[allow(dead_code)]
pub fn artist_id(n: i64) -> ObjectId {
    ObjectId::single("Artist", "ARTIST_ID", Value::Int(n))
}

#[allow(dead_code)]
pub fn painting_id(n: i64) -> ObjectId {
    ObjectId::single("Painting", "PAINTING_ID", Value::Int(n))
}

#[allow(dead_code)]
pub fn seed_artist(storage: &MemoryStorage, id: i64, name: &str) {
    storage
        .insert_row(
            ARTIST,
            row([("ARTIST_ID", Value::Int(id)), ("ARTIST_NAME", name.into())]),
        )
        .unwrap();
}

#[allow(dead_code)]
pub fn seed_painting(storage: &MemoryStorage, id: i64, title: &str, artist: Option<i64>) {
    storage
        .insert_row(
            PAINTING,
            row([
                ("PAINTING_ID", Value::Int(id)),
                ("PAINTING_TITLE", title.into()),
                ("ARTIST_ID", artist.into()),
                ("GALLERY_ID", Value::Null),
            ]),
        )
        .unwrap();
}

#[allow(dead_code)]
pub fn seed_gallery(storage: &MemoryStorage, id: i64, name: &str) {
    storage
        .insert_row(
            GALLERY,
            row([("GALLERY_ID", Value::Int(id)), ("GALLERY_NAME", name.into())]),
        )
        .unwrap();
}

#[allow(dead_code)]
pub fn seed_exhibit(storage: &MemoryStorage, id: i64, gallery: i64) {
    storage
        .insert_row(
            EXHIBIT,
            row([
                ("EXHIBIT_ID", Value::Int(id)),
                ("GALLERY_ID", Value::Int(gallery)),
                ("OPENING_DATE", Value::Null),
            ]),
        )
        .unwrap();
}

#[allow(dead_code)]
pub fn seed_artist_exhibit(storage: &MemoryStorage, artist: i64, exhibit: i64) {
    storage
        .insert_row(
            ARTIST_EXHIBIT,
            row([
                ("ARTIST_ID", Value::Int(artist)),
                ("EXHIBIT_ID", Value::Int(exhibit)),
            ]),
        )
        .unwrap();
}

#[allow(dead_code)]
pub fn seed_group(storage: &MemoryStorage, id: i64, name: &str) {
    storage
        .insert_row(
            ARTGROUP,
            row([
                ("GROUP_ID", Value::Int(id)),
                ("NAME", name.into()),
                ("PARENT_GROUP_ID", Value::Null),
            ]),
        )
        .unwrap();
}

#[allow(dead_code)]
pub fn seed_person(storage: &MemoryStorage, id: i64, kind: &str, name: &str) {
    storage
        .insert_row(
            PERSON,
            row([
                ("PERSON_ID", Value::Int(id)),
                ("PERSON_TYPE", kind.into()),
                ("NAME", name.into()),
                ("SALARY", Value::Null),
            ]),
        )
        .unwrap();
}

/// One gallery (1) with one exhibit (10) showing artists 1 and 2
#[allow(dead_code)]
pub fn seed_gallery_with_exhibit(storage: &MemoryStorage) {
    seed_artist(storage, 1, "a");
    seed_artist(storage, 2, "b");
    seed_gallery(storage, 1, "g");
    seed_exhibit(storage, 10, 1);
    seed_artist_exhibit(storage, 1, 10);
    seed_artist_exhibit(storage, 2, 10);
}
