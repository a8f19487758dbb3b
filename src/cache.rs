use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::StreamExt;
use kube::runtime::reflector::{store::Writer, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tracing::*;

/// A change observed on a watched object.
#[derive(Debug, Clone)]
pub enum Change<K> {
    Applied(Arc<K>),
    Deleted(Arc<K>),
}

/// Locally cached view of one object kind, kept in sync by [`reflect`].
///
/// Watched objects live in a reflector [`Store`]. On top of it the cache keeps an index on
/// UID and the objects this controller wrote itself, which are served until the watch
/// delivers the same or a newer version.
pub struct Cache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store: Store<K>,
    writer: Arc<Mutex<Writer<K>>>,
    index: Arc<RwLock<Index<K>>>,
}

struct Index<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    by_uid: HashMap<String, ObjectRef<K>>,
    written: HashMap<ObjectRef<K>, Arc<K>>,
    // objects not yet seen again since the watcher restarted
    unlisted: Option<HashMap<ObjectRef<K>, Arc<K>>>,
}

impl<K> Clone for Cache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            writer: self.writer.clone(),
            index: self.index.clone(),
        }
    }
}

impl<K> Default for Cache<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Cache key of an object.
pub fn object_key<K: Resource>(obj: &K) -> String {
    let meta = obj.meta();
    let name = meta.name.as_deref().unwrap_or_default();
    match meta.namespace.as_deref() {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

fn key_ref<K: Resource<DynamicType = ()>>(key: &str) -> ObjectRef<K> {
    match key.split_once('/') {
        Some((ns, name)) => ObjectRef::new(name).within(ns),
        None => ObjectRef::new(key),
    }
}

fn resource_version<K: Resource>(obj: &K) -> Option<u64> {
    obj.meta().resource_version.as_deref()?.parse().ok()
}

/// Whether `watched` is at least as recent as `written`. Without comparable versions the
/// watched copy wins.
fn supersedes<K: Resource>(watched: &K, written: &K) -> bool {
    match (resource_version(watched), resource_version(written)) {
        (Some(watched), Some(written)) => watched >= written,
        _ => true,
    }
}

impl<K> Cache<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let writer = Writer::default();
        Self {
            store: writer.as_reader(),
            writer: Arc::new(Mutex::new(writer)),
            index: Arc::new(RwLock::new(Index {
                by_uid: HashMap::new(),
                written: HashMap::new(),
                unlisted: None,
            })),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Index<K>> {
        self.index.read().expect("cache index poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, Index<K>> {
        self.index.write().expect("cache index poisoned")
    }

    fn lookup(&self, index: &Index<K>, key: &ObjectRef<K>) -> Option<Arc<K>> {
        let watched = self.store.get(key);
        match (watched, index.written.get(key)) {
            (Some(watched), Some(written)) if !supersedes(watched.as_ref(), written.as_ref()) => {
                Some(written.clone())
            }
            (watched, written) => watched.or_else(|| written.cloned()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<K>> {
        let index = self.read();
        self.lookup(&index, &key_ref(key))
    }

    pub fn get_by_uid(&self, uid: &str) -> Option<Arc<K>> {
        let index = self.read();
        let key = index.by_uid.get(uid)?;
        self.lookup(&index, key)
            .filter(|obj| obj.meta().uid.as_deref() == Some(uid))
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        let index = self.read();
        let mut objects: HashMap<ObjectRef<K>, Arc<K>> = self
            .store
            .state()
            .into_iter()
            .map(|obj| (ObjectRef::from_obj(obj.as_ref()), obj))
            .collect();
        for (key, written) in &index.written {
            match objects.get(key) {
                Some(watched) if supersedes(watched.as_ref(), written.as_ref()) => {}
                _ => {
                    objects.insert(key.clone(), written.clone());
                }
            }
        }
        objects.into_values().collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.list().iter().map(|obj| object_key(obj.as_ref())).collect()
    }

    /// Records an object written by this controller, returning the shared copy now held by
    /// the cache.
    pub fn insert(&self, obj: K) -> Arc<K> {
        let obj = Arc::new(obj);
        let key = ObjectRef::from_obj(obj.as_ref());
        let mut index = self.write();
        if let Some(uid) = obj.meta().uid.clone() {
            index.by_uid.insert(uid, key.clone());
        }
        index.written.insert(key, obj.clone());
        obj
    }

    /// Waits until the first full listing has been applied.
    pub async fn wait_until_ready(&self) {
        // the writer lives as long as the cache
        let _ = self.store.wait_until_ready().await;
    }

    /// Applies one watcher event, returning the changes handlers should see.
    pub fn apply_watcher_event(&self, event: watcher::Event<K>) -> Vec<Change<K>> {
        let mut index = self.write();
        if let watcher::Event::Init = event {
            // snapshot before the writer starts buffering the relist
            index.unlisted = Some(
                self.store
                    .state()
                    .into_iter()
                    .map(|obj| (ObjectRef::from_obj(obj.as_ref()), obj))
                    .collect(),
            );
        }
        self.writer
            .lock()
            .expect("cache writer poisoned")
            .apply_watcher_event(&event);

        match event {
            watcher::Event::Apply(obj) => {
                let obj = Arc::new(obj);
                index.observe(&obj);
                vec![Change::Applied(obj)]
            }
            watcher::Event::Delete(obj) => {
                let obj = Arc::new(obj);
                index.forget(&obj);
                vec![Change::Deleted(obj)]
            }
            watcher::Event::Init => Vec::new(),
            watcher::Event::InitApply(obj) => {
                let obj = Arc::new(obj);
                if let Some(unlisted) = index.unlisted.as_mut() {
                    unlisted.remove(&ObjectRef::from_obj(obj.as_ref()));
                }
                index.observe(&obj);
                vec![Change::Applied(obj)]
            }
            watcher::Event::InitDone => {
                let pruned = index.unlisted.take().unwrap_or_default();
                for obj in pruned.values() {
                    index.forget(obj);
                }
                pruned.into_values().map(Change::Deleted).collect()
            }
        }
    }
}

impl<K> Index<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn observe(&mut self, obj: &Arc<K>) {
        let key = ObjectRef::from_obj(obj.as_ref());
        if let Some(uid) = obj.meta().uid.clone() {
            self.by_uid.insert(uid, key.clone());
        }
        if self
            .written
            .get(&key)
            .is_some_and(|written| supersedes(obj.as_ref(), written.as_ref()))
        {
            self.written.remove(&key);
        }
    }

    fn forget(&mut self, obj: &Arc<K>) {
        let key = ObjectRef::from_obj(obj.as_ref());
        if let Some(uid) = obj.meta().uid.as_deref() {
            if self.by_uid.get(uid) == Some(&key) {
                self.by_uid.remove(uid);
            }
        }
        if self
            .written
            .get(&key)
            .is_some_and(|written| supersedes(obj.as_ref(), written.as_ref()))
        {
            self.written.remove(&key);
        }
    }
}

/// Keeps `cache` in sync with the cluster, passing each change to `on_change`.
///
/// Runs until the watch stream ends, which only happens when the task is dropped.
pub async fn reflect<K, F>(api: Api<K>, cache: Cache<K>, mut on_change: F)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    F: FnMut(Change<K>) + Send,
{
    let kind = K::kind(&()).to_string();
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    let mut stream = std::pin::pin!(stream);
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                for change in cache.apply_watcher_event(event) {
                    on_change(change);
                }
            }
            Err(err) => warn!(%kind, "Watch failed, retrying: {err}"),
        }
    }
    debug!(%kind, "Watch stream ended");
}
