use std::{sync::Arc, time::Duration};

use futures::{future::BoxFuture, stream::BoxStream};
use reqwest::{Client, Method, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, from_value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::dao::{
    models::{RoomDocument, RoomEvent, RoomUpdate},
    room_store::RoomStore,
    storage::{StorageError, StorageResult},
};

use super::{
    config::CouchConfig,
    error::{CouchDaoError, CouchResult},
    models::{
        AllDocsResponse, ChangesResponse, CouchRoomDocument, END_SUFFIX, PutResponse, ROOM_PREFIX,
        room_doc_id, seq_token,
    },
};

const MAX_WRITE_ATTEMPTS: usize = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Room store backed by a CouchDB database, one document per room.
#[derive(Clone)]
pub struct CouchRoomStore {
    client: Client,
    base_url: Arc<str>,
    database: Arc<str>,
    auth: Option<(Arc<str>, Arc<str>)>,
    longpoll_timeout: Duration,
}

impl CouchRoomStore {
    /// Establish a connection to CouchDB and ensure the database exists.
    pub async fn connect(config: CouchConfig) -> CouchResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|source| CouchDaoError::ClientBuilder { source })?;

        let base_url = Arc::<str>::from(config.base_url.trim_end_matches('/'));
        let database = Arc::<str>::from(config.database);
        let auth = config
            .username
            .zip(config.password)
            .map(|(u, p)| (Arc::<str>::from(u), Arc::<str>::from(p)));

        let store = Self {
            client,
            base_url,
            database,
            auth,
            longpoll_timeout: config.longpoll_timeout,
        };

        store.ensure_database().await?;
        Ok(store)
    }

    fn with_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some((ref user, ref pass)) = self.auth {
            builder.basic_auth(user.as_ref(), Some(pass.as_ref()))
        } else {
            builder
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}/{}", self.base_url, self.database, path);
        self.with_auth(self.client.request(method, url))
    }

    async fn ensure_database(&self) -> CouchResult<()> {
        let database = self.database.to_string();
        let url = format!("{}/{}", self.base_url, self.database);

        let response = self
            .with_auth(self.client.get(&url))
            .send()
            .await
            .map_err(|source| CouchDaoError::Database {
                database: database.clone(),
                action: "open",
                source,
            })?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => {
                let create = self
                    .with_auth(self.client.put(&url))
                    .send()
                    .await
                    .map_err(|source| CouchDaoError::Database {
                        database: database.clone(),
                        action: "create",
                        source,
                    })?;
                // 412 means another client created it first.
                if create.status().is_success() || create.status() == StatusCode::PRECONDITION_FAILED
                {
                    Ok(())
                } else {
                    Err(CouchDaoError::DatabaseStatus {
                        database,
                        status: create.status(),
                    })
                }
            }
            other => Err(CouchDaoError::DatabaseStatus {
                database,
                status: other,
            }),
        }
    }

    async fn get_document<T>(&self, doc_id: &str) -> CouchResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let response = self
            .request(Method::GET, doc_id)
            .send()
            .await
            .map_err(|source| CouchDaoError::Transport {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                response.json::<T>().await.map(Some).map_err(|source| {
                    CouchDaoError::MalformedBody {
                        path: doc_id.to_string(),
                        source,
                    }
                })
            }
            other => Err(CouchDaoError::UnexpectedStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    async fn put_document<T>(&self, doc_id: &str, document: &T) -> CouchResult<String>
    where
        T: ?Sized + Serialize,
    {
        let response = self
            .request(Method::PUT, doc_id)
            .json(document)
            .send()
            .await
            .map_err(|source| CouchDaoError::Transport {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::CONFLICT => Err(CouchDaoError::Conflict {
                path: doc_id.to_string(),
            }),
            status if status.is_success() => response
                .json::<PutResponse>()
                .await
                .map(|put| put.rev)
                .map_err(|source| CouchDaoError::MalformedBody {
                    path: doc_id.to_string(),
                    source,
                }),
            other => Err(CouchDaoError::UnexpectedStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    async fn delete_document(&self, doc_id: &str, rev: &str) -> CouchResult<()> {
        let response = self
            .request(Method::DELETE, doc_id)
            .query(&[("rev", rev)])
            .send()
            .await
            .map_err(|source| CouchDaoError::Transport {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            StatusCode::CONFLICT => Err(CouchDaoError::Conflict {
                path: doc_id.to_string(),
            }),
            status if status.is_success() => Ok(()),
            other => Err(CouchDaoError::UnexpectedStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    async fn list_documents<T>(&self, prefix: &str) -> CouchResult<Vec<T>>
    where
        T: DeserializeOwned,
    {
        const ALL_DOCS: &str = "_all_docs";
        let query = [
            ("include_docs", "true".to_string()),
            ("startkey", format!("\"{}\"", prefix)),
            ("endkey", format!("\"{}{}\"", prefix, END_SUFFIX)),
        ];

        let response = self
            .request(Method::GET, ALL_DOCS)
            .query(&query)
            .send()
            .await
            .map_err(|source| CouchDaoError::Transport {
                path: ALL_DOCS.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CouchDaoError::UnexpectedStatus {
                path: ALL_DOCS.to_string(),
                status: response.status(),
            });
        }

        let payload = response.json::<AllDocsResponse>().await.map_err(|source| {
            CouchDaoError::MalformedBody {
                path: ALL_DOCS.to_string(),
                source,
            }
        })?;

        payload
            .rows
            .into_iter()
            .filter_map(|row| row.doc)
            .map(|doc| {
                from_value(doc).map_err(|source| CouchDaoError::InvalidDocument {
                    path: ALL_DOCS.to_string(),
                    source,
                })
            })
            .collect()
    }

    /// Read-modify-write with the document revision; conflicting writers retry.
    async fn update_document(
        &self,
        room_id: &str,
        update: RoomUpdate,
    ) -> StorageResult<RoomDocument> {
        let doc_id = room_doc_id(room_id);
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let Some(mut doc) = self.get_document::<CouchRoomDocument>(&doc_id).await? else {
                return Err(StorageError::NotFound {
                    room_id: room_id.to_string(),
                });
            };

            if let Some(precondition) = &update.precondition {
                precondition
                    .check(&doc.room)
                    .map_err(|reason| StorageError::PreconditionFailed {
                        room_id: room_id.to_string(),
                        reason,
                    })?;
            }

            update.apply(&mut doc.room);
            match self.put_document(&doc_id, &doc).await {
                Ok(_) => return Ok(doc.room),
                Err(CouchDaoError::Conflict { .. }) => {
                    debug!(room_id, attempt, "room write conflicted; re-reading");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(CouchDaoError::ConflictRetriesExhausted {
            path: doc_id,
            attempts: MAX_WRITE_ATTEMPTS,
        }
        .into())
    }

    /// One call to `_changes` restricted to a single document.
    ///
    /// Without a sequence token the feed is read once from the start, which yields only the
    /// latest revision; afterwards it long-polls from the given token.
    async fn poll_changes(
        &self,
        doc_id: &str,
        since: Option<&str>,
    ) -> CouchResult<ChangesResponse> {
        const CHANGES: &str = "_changes";
        let mut query = vec![
            ("filter", "_doc_ids".to_string()),
            ("include_docs", "true".to_string()),
        ];
        match since {
            Some(token) => {
                query.push(("feed", "longpoll".to_string()));
                query.push(("since", token.to_string()));
                query.push((
                    "timeout",
                    self.longpoll_timeout.as_millis().to_string(),
                ));
            }
            None => query.push(("since", "0".to_string())),
        }

        let response = self
            .request(Method::POST, CHANGES)
            .query(&query)
            .json(&json!({ "doc_ids": [doc_id] }))
            .send()
            .await
            .map_err(|source| CouchDaoError::Transport {
                path: CHANGES.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CouchDaoError::UnexpectedStatus {
                path: CHANGES.to_string(),
                status: response.status(),
            });
        }

        response
            .json::<ChangesResponse>()
            .await
            .map_err(|source| CouchDaoError::MalformedBody {
                path: CHANGES.to_string(),
                source,
            })
    }

    fn change_event(doc_id: &str, deleted: bool, doc: Option<Value>) -> CouchResult<RoomEvent> {
        match doc {
            Some(doc) if !deleted => from_value::<CouchRoomDocument>(doc)
                .map(|doc| RoomEvent::Snapshot(doc.room))
                .map_err(|source| CouchDaoError::InvalidDocument {
                    path: doc_id.to_string(),
                    source,
                }),
            _ => Ok(RoomEvent::Absent),
        }
    }

    /// Forward the document's change feed into `tx` until the receiver goes away.
    async fn forward_changes(self, doc_id: String, tx: mpsc::Sender<StorageResult<RoomEvent>>) {
        let mut since: Option<String> = None;
        let mut backoff = INITIAL_BACKOFF;

        'feed: loop {
            let outcome = tokio::select! {
                _ = tx.closed() => break,
                outcome = self.poll_changes(&doc_id, since.as_deref()) => outcome,
            };

            match outcome {
                Ok(page) => {
                    backoff = INITIAL_BACKOFF;
                    if since.is_none()
                        && page.results.is_empty()
                        && tx.send(Ok(RoomEvent::Absent)).await.is_err()
                    {
                        break;
                    }
                    for row in page.results {
                        let event = Self::change_event(&doc_id, row.deleted, row.doc)
                            .map_err(StorageError::from);
                        if tx.send(event).await.is_err() {
                            break 'feed;
                        }
                    }
                    since = Some(seq_token(&page.last_seq));
                }
                Err(err) => {
                    warn!(doc_id = %doc_id, error = %err, retry_in = ?backoff, "room change feed failed");
                    tokio::select! {
                        _ = tx.closed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        debug!(doc_id = %doc_id, "room change feed released");
    }
}

impl RoomStore for CouchRoomStore {
    fn create_room(&self, room: RoomDocument) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let doc_id = room_doc_id(&room.room_id);
            let rev = store
                .get_document::<CouchRoomDocument>(&doc_id)
                .await?
                .and_then(|existing| existing.rev);
            let doc = CouchRoomDocument::new(room, rev);
            store.put_document(&doc_id, &doc).await?;
            Ok(())
        })
    }

    fn get_room(&self, room_id: &str) -> BoxFuture<'static, StorageResult<Option<RoomDocument>>> {
        let store = self.clone();
        let doc_id = room_doc_id(room_id);
        Box::pin(async move {
            let maybe_doc = store.get_document::<CouchRoomDocument>(&doc_id).await?;
            Ok(maybe_doc.map(|doc| doc.room))
        })
    }

    fn update_room(
        &self,
        room_id: &str,
        update: RoomUpdate,
    ) -> BoxFuture<'static, StorageResult<RoomDocument>> {
        let store = self.clone();
        let room_id = room_id.to_string();
        Box::pin(async move { store.update_document(&room_id, update).await })
    }

    fn delete_room(&self, room_id: &str) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        let doc_id = room_doc_id(room_id);
        Box::pin(async move {
            for _ in 0..MAX_WRITE_ATTEMPTS {
                let Some(existing) = store.get_document::<CouchRoomDocument>(&doc_id).await? else {
                    return Ok(());
                };
                let Some(rev) = existing.rev else {
                    return Ok(());
                };
                match store.delete_document(&doc_id, &rev).await {
                    Ok(()) => return Ok(()),
                    Err(CouchDaoError::Conflict { .. }) => continue,
                    Err(err) => return Err(err.into()),
                }
            }
            Err(CouchDaoError::ConflictRetriesExhausted {
                path: doc_id,
                attempts: MAX_WRITE_ATTEMPTS,
            }
            .into())
        })
    }

    fn list_rooms(&self) -> BoxFuture<'static, StorageResult<Vec<RoomDocument>>> {
        let store = self.clone();
        Box::pin(async move {
            let docs = store
                .list_documents::<CouchRoomDocument>(ROOM_PREFIX)
                .await?;
            Ok(docs.into_iter().map(|doc| doc.room).collect())
        })
    }

    fn subscribe(&self, room_id: &str) -> BoxStream<'static, StorageResult<RoomEvent>> {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(self.clone().forward_changes(room_doc_id(room_id), tx));
        Box::pin(ReceiverStream::new(rx))
    }
}
