use anyhow::{Result, Context};
use async_trait::async_trait;
use chrono::Utc;
use mongodb::{Client, Database, Collection, options::ClientOptions};
use mongodb::bson::{doc, Document};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::cli::config::PageStoreSettings;
use crate::crawler::task::canonical_domain;

/// Trait for fetched page storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageStore: Send + Sync {
    /// Persist one fetched version of the page at (domain, urlpath)
    async fn save(&self, domain: &str, urlpath: &str, page: &str) -> Result<()>;
}

/// Factory for creating a PageStore implementation
pub struct PageStoreFactory;

impl PageStoreFactory {
    /// Create a new PageStore instance based on the settings
    pub async fn create(settings: &PageStoreSettings) -> Result<Arc<dyn PageStore>> {
        match settings.storage_type.as_str() {
            "filesystem" => {
                let store = LocalPageStore::new(&settings.directory).await?;
                Ok(Arc::new(store))
            },
            "mongodb" => {
                let store = MongoPageStore::new(settings).await?;
                Ok(Arc::new(store))
            },
            _ => {
                anyhow::bail!("Unsupported page store type: {}", settings.storage_type);
            }
        }
    }
}

/// Filesystem implementation of PageStore.
///
/// Layout: `<dir>/<domain>/<sha256(urlpath)>/<unix ts>`, one file per fetch.
pub struct LocalPageStore {
    dir: PathBuf,
}

impl LocalPageStore {
    /// Create the store, making sure the root directory exists
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .context(format!("Failed to create page directory: {}", dir.display()))?;

        Ok(Self { dir })
    }

    /// Directory holding every version of one page; always below the root
    pub fn page_dir(&self, domain: &str, urlpath: &str) -> Result<PathBuf> {
        let digest = Sha256::digest(urlpath.as_bytes());
        Ok(self.dir
            .join(host_dir(domain)?)
            .join(hex::encode(digest)))
    }
}

/// Single path component naming the host of `domain`, port included
fn host_dir(domain: &str) -> Result<String> {
    let url = url::Url::parse(&format!("http://{}/", canonical_domain(domain)))
        .context(format!("Invalid page domain: {}", domain))?;

    let host = match url.host_str() {
        Some(host) if !host.is_empty() && !host.chars().all(|c| c == '.') => host,
        _ => anyhow::bail!("Page domain has no usable host: {}", domain),
    };

    Ok(match url.port() {
        Some(port) => format!("{}_{}", host, port),
        None => host.to_string(),
    })
}

#[async_trait]
impl PageStore for LocalPageStore {
    async fn save(&self, domain: &str, urlpath: &str, page: &str) -> Result<()> {
        let dest_dir = self.page_dir(domain, urlpath)?;

        tokio::fs::create_dir_all(&dest_dir)
            .await
            .context(format!("Failed to create directory for {}{}", domain, urlpath))?;

        let file = dest_dir.join(Utc::now().timestamp().to_string());
        tokio::fs::write(&file, page)
            .await
            .context(format!("Failed to save page {}{}", domain, urlpath))?;

        debug!("Saved page {}{} to {}", domain, urlpath, file.display());

        Ok(())
    }
}

/// MongoDB implementation of PageStore
pub struct MongoPageStore {
    /// MongoDB database
    database: Database,

    /// Collection prefix
    collection_prefix: String,
}

impl MongoPageStore {
    /// Connect and verify the server is reachable
    pub async fn new(settings: &PageStoreSettings) -> Result<Self> {
        // Parse connection options
        let client_options = ClientOptions::parse(&settings.connection_string)
            .await
            .context(format!("Failed to parse MongoDB connection string: {}", settings.connection_string))?;

        let client = Client::with_options(client_options)
            .context("Failed to create MongoDB client")?;

        let database = client.database(&settings.database_name);

        // Fail now rather than on the first page
        database.list_collection_names(None)
            .await
            .context("Failed to connect to MongoDB")?;

        debug!("Connected to MongoDB database: {}", settings.database_name);

        Ok(Self {
            database,
            collection_prefix: settings.collection_prefix.clone(),
        })
    }

    fn pages_collection(&self) -> Collection<Document> {
        self.database.collection(&format!("{}_pages", self.collection_prefix))
    }
}

#[async_trait]
impl PageStore for MongoPageStore {
    async fn save(&self, domain: &str, urlpath: &str, page: &str) -> Result<()> {
        let document = doc! {
            "domain": canonical_domain(domain),
            "urlpath": urlpath,
            "content": page,
            "fetched_at": Utc::now().timestamp(),
        };

        self.pages_collection()
            .insert_one(document, None)
            .await
            .context("Failed to store page in MongoDB")?;

        debug!("Stored page {}{} in MongoDB", domain, urlpath);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_store_writes_versioned_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalPageStore::new(dir.path().join("pages")).await.unwrap();

        store.save("http://example.com", "/news?id=1", "<html></html>").await.unwrap();

        let page_dir = store.page_dir("http://example.com", "/news?id=1").unwrap();
        assert!(page_dir.starts_with(dir.path().join("pages").join("example.com")));

        let mut entries = std::fs::read_dir(&page_dir).unwrap();
        let file = entries.next().unwrap().unwrap().path();
        assert_eq!(std::fs::read_to_string(file).unwrap(), "<html></html>");
    }

    #[tokio::test]
    async fn test_local_store_stays_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("pages");
        let store = LocalPageStore::new(&root).await.unwrap();

        store.save("http://evil.com/../../escaped", "/x", "page").await.unwrap();
        assert!(store.page_dir("http://evil.com/../../escaped", "/x").unwrap().starts_with(root.join("evil.com")));
        assert!(!dir.path().join("escaped").exists());

        for domain in ["/etc", "http://../outside", "..", "http://", "a.com/../../../tmp", "http://127.0.0.1:8080"] {
            if let Ok(page_dir) = store.page_dir(domain, "/x") {
                assert!(page_dir.starts_with(&root), "{} -> {}", domain, page_dir.display());
                assert_eq!(page_dir.strip_prefix(&root).unwrap().components().count(), 2, "{}", domain);
            }
        }
        assert!(store.page_dir("http://127.0.0.1:8080", "/").unwrap().starts_with(root.join("127.0.0.1_8080")));
    }

    #[tokio::test]
    async fn test_factory_rejects_unknown_type() {
        let settings = PageStoreSettings {
            storage_type: "weedfs".to_string(),
            directory: String::new(),
            connection_string: String::new(),
            database_name: String::new(),
            collection_prefix: String::new(),
        };
        assert!(PageStoreFactory::create(&settings).await.is_err());
    }

    #[tokio::test]
    async fn test_factory_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PageStoreSettings {
            storage_type: "filesystem".to_string(),
            directory: dir.path().to_string_lossy().into_owned(),
            connection_string: String::new(),
            database_name: String::new(),
            collection_prefix: String::new(),
        };

        let store = PageStoreFactory::create(&settings).await.unwrap();
        store.save("example.com", "/", "page").await.unwrap();
    }
}
