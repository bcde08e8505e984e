//! Account-keyed client pool over grammers.
//!
//! One session is active at a time; renting a different account disconnects
//! the previous session cleanly before the new one connects. Public verbs
//! hold the pool lease for their whole duration, so each session sees at
//! most one in-flight upstream call.

use super::rate_limit::UpstreamPacer;
use super::{EntityKind, FetchedMessage, ResolvedEntity};
use crate::attribution::with_header;
use crate::config::{AccountConfig, Config};
use crate::db::Archive;
use crate::error::{Error, Result};
use crate::scratch::ScratchDir;

use grammers_client::types::Peer;
use grammers_client::{Client, InputMessage, SignInError};
use grammers_mtsender::{ConnectionParams, InvocationError, SenderPool, SenderPoolHandle};
use grammers_session::defs::PeerRef;
use grammers_session::storages::SqliteSession;
use grammers_session::types::PeerKind;
use grammers_tl_types as tl;

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Login token for completing sign-in
pub struct LoginToken {
    inner: grammers_client::types::LoginToken,
}

/// Password token for 2FA
pub struct PasswordToken {
    inner: grammers_client::types::PasswordToken,
}

impl PasswordToken {
    /// Get the password hint
    pub fn hint(&self) -> Option<&str> {
        self.inner.hint()
    }
}

/// Connected session state
struct ActiveClient {
    session_name: String,
    account: AccountConfig,
    client: Client,
    #[allow(dead_code)]
    session: Arc<SqliteSession>,
    pool_handle: SenderPoolHandle,
    _pool_task: JoinHandle<()>,
}

/// Authorized, proxy-wrapped clients keyed by account.
pub struct ClientPool {
    config: Arc<Config>,
    session_dir: PathBuf,
    archive: Arc<Archive>,
    pacer: UpstreamPacer,
    active: Mutex<Option<ActiveClient>>,
    /// Serializes public verbs: one upstream call in flight per session.
    lease: Mutex<()>,
}

impl ClientPool {
    pub fn new(config: Arc<Config>, session_dir: PathBuf, archive: Arc<Archive>) -> Self {
        let pacer = UpstreamPacer::new(4, 5.0, &config.retry);
        ClientPool {
            config,
            session_dir,
            archive,
            pacer,
            active: Mutex::new(None),
            lease: Mutex::new(()),
        }
    }

    /// Session artifact path for an account.
    fn session_path(&self, session_name: &str) -> PathBuf {
        self.session_dir.join(format!("{}.session", session_name))
    }

    /// Bound a single upstream verb by the configured timeout. Iteration
    /// stays unbounded; it is cancelable between items instead. Outcomes
    /// feed the pacer: flood waits widen verb spacing, clean verbs narrow
    /// it again.
    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, InvocationError>>,
    {
        let timeout = Duration::from_secs(self.config.upstream_timeout_seconds.max(1));
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => {
                self.pacer.note_success();
                Ok(value)
            }
            Ok(Err(e)) => Err(self.observe(classify(e))),
            Err(_) => Err(Error::Timeout(what.to_string())),
        }
    }

    /// Record upstream feedback for an already-classified error.
    fn observe(&self, e: Error) -> Error {
        if matches!(e, Error::RateLimited { .. }) {
            self.pacer.note_flood_wait();
        }
        e
    }

    /// Return a connected client for the selected account, verifying
    /// authorization. A cached client for the same account is reused;
    /// renting a different account disconnects the previous session.
    async fn rent(&self, account: Option<&str>, require_auth: bool) -> Result<(Client, AccountConfig)> {
        let account = self.config.pick_account(account)?.clone();
        let mut guard = self.active.lock().await;

        if let Some(active) = guard.as_ref() {
            if active.session_name == account.session_name {
                if !require_auth || active.client.is_authorized().await.unwrap_or(false) {
                    debug!("reusing connected session {}", active.session_name);
                    return Ok((active.client.clone(), active.account.clone()));
                }
                warn!(
                    "session {} no longer authorized, reconnecting",
                    active.session_name
                );
            }
        }

        if let Some(previous) = guard.take() {
            info!("disconnecting session {}", previous.session_name);
            previous.pool_handle.quit();
        }

        let state = self.connect(&account).await?;
        if require_auth {
            let authorized = state.client.is_authorized().await.map_err(|e| {
                Error::TelegramClient(format!("failed to check authorization: {}", e))
            })?;
            if !authorized {
                state.pool_handle.quit();
                return Err(Error::AuthRequired(account.session_name.clone()));
            }
        }

        let client = state.client.clone();
        *guard = Some(state);
        Ok((client, account))
    }

    async fn connect(&self, account: &AccountConfig) -> Result<ActiveClient> {
        let session_path = self.session_path(&account.session_name);
        if let Some(parent) = session_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Config {
                    field: "session".to_string(),
                    reason: format!("failed to create session directory: {}", e),
                }
            })?;
        }

        let session = Arc::new(SqliteSession::open(&session_path).map_err(|e| {
            Error::TelegramClient(format!("failed to open session: {}", e))
        })?);

        let mut params = ConnectionParams {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            device_model: "tgrelay".to_string(),
            ..Default::default()
        };
        if let Some(proxy) = &self.config.proxy {
            if proxy.enabled {
                params.proxy_url = Some(proxy.url());
            }
        }

        let pool = SenderPool::with_configuration(Arc::clone(&session), account.api_id, params);
        let client = Client::new(&pool);
        let SenderPool { runner, handle, .. } = pool;

        let pool_task = tokio::spawn(runner.run());

        info!("connected session {}", account.session_name);
        Ok(ActiveClient {
            session_name: account.session_name.clone(),
            account: account.clone(),
            client,
            session,
            pool_handle: handle,
            _pool_task: pool_task,
        })
    }

    /// Disconnect whatever session is active.
    pub async fn disconnect(&self) {
        let mut guard = self.active.lock().await;
        if let Some(active) = guard.take() {
            active.pool_handle.quit();
            info!("disconnected session {}", active.session_name);
        }
    }

    // Authentication -------------------------------------------------------

    pub async fn is_authorized(&self, account: Option<&str>) -> Result<bool> {
        let _lease = self.lease.lock().await;
        let (client, _) = self.rent(account, false).await?;
        client
            .is_authorized()
            .await
            .map_err(|e| Error::TelegramClient(format!("failed to check authorization: {}", e)))
    }

    /// Request login code for the account's phone number.
    pub async fn request_login_code(&self, account: Option<&str>) -> Result<LoginToken> {
        let _lease = self.lease.lock().await;
        let (client, account) = self.rent(account, false).await?;
        let phone = account
            .phone_number
            .clone()
            .ok_or_else(|| Error::AccountNotFound(format!(
                "account {} has no phone number",
                account.session_name
            )))?;

        let token = client
            .request_login_code(&phone, &account.api_hash)
            .await
            .map_err(|e| Error::TelegramClient(format!("failed to request login code: {}", e)))?;
        Ok(LoginToken { inner: token })
    }

    /// Sign in with the received code. Returns a password token when the
    /// account has 2FA enabled.
    pub async fn sign_in(
        &self,
        account: Option<&str>,
        token: &LoginToken,
        code: &str,
    ) -> Result<Option<PasswordToken>> {
        let _lease = self.lease.lock().await;
        let (client, account) = self.rent(account, false).await?;
        match client.sign_in(&token.inner, code).await {
            Ok(_) => {
                info!("signed in as {}", account.session_name);
                Ok(None)
            }
            Err(SignInError::PasswordRequired(password_token)) => Ok(Some(PasswordToken {
                inner: password_token,
            })),
            Err(e) => Err(Error::AuthRequired(format!("sign in failed: {}", e))),
        }
    }

    pub async fn check_password(
        &self,
        account: Option<&str>,
        token: PasswordToken,
        password: &str,
    ) -> Result<()> {
        let _lease = self.lease.lock().await;
        let (client, account) = self.rent(account, false).await?;
        client
            .check_password(token.inner, password)
            .await
            .map_err(|e| Error::AuthRequired(format!("password check failed: {}", e)))?;
        info!("authenticated {} with 2FA", account.session_name);
        Ok(())
    }

    // Entity resolution ----------------------------------------------------

    /// Resolve a handle or numeric id into an entity, recording which
    /// account can see it.
    pub async fn resolve_entity(&self, account: Option<&str>, reference: &str) -> Result<ResolvedEntity> {
        let _lease = self.lease.lock().await;
        let (client, account) = self.rent(account, true).await?;
        let entity = self.resolve_inner(&client, reference).await?;

        // Visibility bookkeeping feeds fleet-wide channel discovery.
        if entity.kind != EntityKind::User {
            let who = account
                .phone_number
                .clone()
                .unwrap_or_else(|| account.session_name.clone());
            let access_hash = entity.peer.auth.hash();
            if let Err(e) = self.archive.upsert_account_channel_access(
                &who,
                entity.id,
                Some(&entity.title),
                Some(access_hash),
            ) {
                warn!("failed to record channel access: {}", e);
            }
        }
        Ok(entity)
    }

    async fn resolve_inner(&self, client: &Client, reference: &str) -> Result<ResolvedEntity> {
        let reference = reference.trim();
        if !crate::config::is_valid_entity(reference) {
            return Err(Error::EntityNotFound(reference.to_string()));
        }
        let _permit = self.pacer.admit().await;

        if let Ok(id) = reference.parse::<i64>() {
            return self.resolve_by_id(client, id).await;
        }

        let name = reference.trim_start_matches('@');
        match self
            .bounded("resolve_username", client.resolve_username(name))
            .await?
        {
            Some(peer) => Ok(entity_from_peer(peer)),
            None => self.resolve_by_name(client, name).await,
        }
    }

    /// Integer references are matched against the dialog list, in bare,
    /// negated, and bot-API dialog forms.
    async fn resolve_by_id(&self, client: &Client, id: i64) -> Result<ResolvedEntity> {
        let mut dialogs = client.iter_dialogs();
        while let Some(dialog) = dialogs.next().await.map_err(|e| self.observe(classify(e)))? {
            let peer = dialog.peer().clone();
            let pid = peer.id();
            if pid.bare_id() == id || pid.bare_id() == -id || pid.bot_api_dialog_id() == id {
                return Ok(entity_from_peer(peer));
            }
        }
        Err(Error::EntityNotFound(id.to_string()))
    }

    async fn resolve_by_name(&self, client: &Client, name: &str) -> Result<ResolvedEntity> {
        let mut dialogs = client.iter_dialogs();
        while let Some(dialog) = dialogs.next().await.map_err(|e| self.observe(classify(e)))? {
            let peer = dialog.peer().clone();
            if peer.name().is_some_and(|n| n.eq_ignore_ascii_case(name)) {
                return Ok(entity_from_peer(peer));
            }
        }
        Err(Error::EntityNotFound(name.to_string()))
    }

    // History --------------------------------------------------------------

    /// Pull messages newer than `min_id` from an entity, ascending by id.
    /// Fetching pauses between batches to respect upstream pacing.
    pub async fn iter_history(
        &self,
        account: Option<&str>,
        entity: &ResolvedEntity,
        min_id: i32,
        media_only: bool,
    ) -> Result<Vec<FetchedMessage>> {
        let _lease = self.lease.lock().await;
        let (client, _) = self.rent(account, true).await?;
        let _permit = self.pacer.admit().await;

        let batch = self.config.batch as usize;
        let pause = Duration::from_secs_f64(self.config.sleep_between_batches);

        let mut out = Vec::new();
        let mut in_batch = 0usize;
        let mut iter = client.iter_messages(entity.peer());
        while let Some(msg) = iter.next().await.map_err(|e| self.observe(classify(e)))? {
            if msg.id() <= min_id {
                break;
            }
            if media_only && msg.media().is_none() {
                continue;
            }
            out.push(wrap_message(&msg));
            in_batch += 1;
            if in_batch >= batch {
                in_batch = 0;
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            }
        }
        out.reverse();
        debug!("fetched {} message(s) from {}", out.len(), entity.id);
        Ok(out)
    }

    // Forwarding verbs -------------------------------------------------------

    /// Forward messages by id between entities. Returns how many landed.
    pub async fn forward_messages(
        &self,
        account: Option<&str>,
        from: &ResolvedEntity,
        ids: &[i32],
        to: &ResolvedEntity,
    ) -> Result<usize> {
        let _lease = self.lease.lock().await;
        let (client, _) = self.rent(account, true).await?;
        let _permit = self.pacer.admit().await;

        let forwarded = self
            .bounded(
                "forward_messages",
                client.forward_messages(to.peer(), ids, from.peer()),
            )
            .await?;
        Ok(forwarded.into_iter().flatten().count())
    }

    /// Send a new message, optionally uploading a file, optionally into a
    /// forum topic.
    pub async fn send_message(
        &self,
        account: Option<&str>,
        to: &ResolvedEntity,
        text: &str,
        file: Option<&Path>,
        reply_to: Option<i32>,
    ) -> Result<i32> {
        let _lease = self.lease.lock().await;
        let (client, _) = self.rent(account, true).await?;
        self.send_inner(&client, to, text, file, reply_to).await
    }

    async fn send_inner(
        &self,
        client: &Client,
        to: &ResolvedEntity,
        text: &str,
        file: Option<&Path>,
        reply_to: Option<i32>,
    ) -> Result<i32> {
        let _permit = self.pacer.admit().await;

        let mut message = InputMessage::text(text);
        if let Some(path) = file {
            let data = tokio::fs::read(path).await?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            let len = data.len();
            let mut cursor = Cursor::new(data);
            let uploaded = client
                .upload_stream(&mut cursor, len, name)
                .await
                .map_err(|e| Error::Upload(format!("failed to upload file: {}", e)))?;
            message = message.document(uploaded);
        }
        if let Some(topic_id) = reply_to {
            message = message.reply_to(Some(topic_id));
        }

        let sent = self
            .bounded("send_message", client.send_message(to.peer(), message))
            .await?;
        Ok(sent.id())
    }

    /// Download a message's media into a scratch directory. The file is
    /// written under a temp name and renamed when complete.
    pub async fn download_media(
        &self,
        account: Option<&str>,
        msg: &FetchedMessage,
        scratch: &ScratchDir,
    ) -> Result<PathBuf> {
        let _lease = self.lease.lock().await;
        let (client, _) = self.rent(account, true).await?;
        self.download_inner(&client, msg, scratch).await
    }

    async fn download_inner(
        &self,
        client: &Client,
        msg: &FetchedMessage,
        scratch: &ScratchDir,
    ) -> Result<PathBuf> {
        let media = msg
            .media
            .clone()
            .ok_or_else(|| Error::Download(format!("message {} has no media", msg.id)))?;

        let _permit = self.pacer.admit().await;
        let name = msg.scratch_name();
        let temp = scratch.temp_path(&name);

        let mut file = tokio::fs::File::create(&temp).await?;
        let mut download = client.iter_download(&media);
        while let Some(chunk) = download
            .next()
            .await
            .map_err(|e| Error::Download(format!("failed to download chunk: {}", e)))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let final_path = scratch.commit(&name)?;
        debug!("downloaded message {} media to {}", msg.id, final_path.display());
        Ok(final_path)
    }

    /// Fetch a single message by id.
    pub async fn get_message(
        &self,
        account: Option<&str>,
        entity: &ResolvedEntity,
        id: i32,
    ) -> Result<Option<FetchedMessage>> {
        let _lease = self.lease.lock().await;
        let (client, _) = self.rent(account, true).await?;
        let _permit = self.pacer.admit().await;

        let messages = self
            .bounded(
                "get_messages_by_id",
                client.get_messages_by_id(entity.peer(), &[id]),
            )
            .await?;
        Ok(messages
            .into_iter()
            .next()
            .flatten()
            .map(|m| wrap_message(&m)))
    }

    /// Delete messages in an entity. Returns how many were deleted.
    pub async fn delete_messages(
        &self,
        account: Option<&str>,
        entity: &ResolvedEntity,
        ids: &[i32],
    ) -> Result<usize> {
        let _lease = self.lease.lock().await;
        let (client, _) = self.rent(account, true).await?;
        let _permit = self.pacer.admit().await;

        self.bounded("delete_messages", client.delete_messages(entity.peer(), ids))
            .await
    }

    /// List up to `limit` participants of an entity as (id, display name).
    pub async fn get_participants(
        &self,
        account: Option<&str>,
        entity: &ResolvedEntity,
        limit: usize,
    ) -> Result<Vec<(i64, String)>> {
        let _lease = self.lease.lock().await;
        let (client, _) = self.rent(account, true).await?;
        let _permit = self.pacer.admit().await;

        let mut out = Vec::new();
        let mut iter = client.iter_participants(entity.peer());
        while let Some(participant) = iter.next().await.map_err(|e| self.observe(classify(e)))? {
            out.push((participant.user.id(), participant.user.full_name()));
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Forward a message group to the Saved Messages of every active
    /// account, swapping sessions as needed. Per-account failures are
    /// logged and skipped; the previous session is always closed cleanly
    /// before the next connects.
    pub async fn forward_to_saved_messages(
        &self,
        from: &ResolvedEntity,
        ids: &[i32],
    ) -> Result<()> {
        let _lease = self.lease.lock().await;
        let accounts: Vec<AccountConfig> =
            self.config.active_accounts().into_iter().cloned().collect();

        for account in accounts {
            let session = account.session_name.clone();
            match self.rent(Some(&session), true).await {
                Ok((client, _)) => {
                    let result: Result<()> = async {
                        let me = client.get_me().await.map_err(|e| {
                            Error::TelegramClient(format!("failed to get self: {}", e))
                        })?;
                        let me_peer = PeerRef::from(me.raw);
                        let _permit = self.pacer.admit().await;
                        self.bounded(
                            "forward_messages",
                            client.forward_messages(me_peer, ids, from.peer()),
                        )
                        .await?;
                        Ok(())
                    }
                    .await;
                    match result {
                        Ok(()) => info!("forwarded group to Saved Messages of {}", session),
                        Err(e) => warn!("saved-messages forward failed for {}: {}", session, e),
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => warn!("skipping account {} for saved messages: {}", session, e),
            }
        }
        Ok(())
    }

    /// Workaround for sources with forwarding disabled: download the media
    /// and send a fresh message instead. Scratch files are removed on every
    /// exit path. Text-only messages skip the media leg.
    pub async fn repost_via_download(
        &self,
        account: Option<&str>,
        msg: &FetchedMessage,
        to: &ResolvedEntity,
        attribution: &str,
        reply_to: Option<i32>,
    ) -> Result<()> {
        let _lease = self.lease.lock().await;
        let (client, _) = self.rent(account, true).await?;

        let text = with_header(attribution, &msg.text);

        if msg.has_media() {
            let scratch = ScratchDir::create(Path::new(&self.config.media_dir))?;
            let path = self.download_inner(&client, msg, &scratch).await?;
            let body = if text.is_empty() { "File" } else { text.as_str() };
            let result = self
                .send_inner(&client, to, body, Some(&path), reply_to)
                .await;
            drop(scratch);
            result?;
            info!("reposted message {} with media", msg.id);
            return Ok(());
        }

        if text.is_empty() {
            return Err(Error::Download(format!(
                "message {} has no text or media to repost",
                msg.id
            )));
        }
        self.send_inner(&client, to, &text, None, reply_to).await?;
        info!("reposted message {} as text", msg.id);
        Ok(())
    }
}

/// Map upstream invocation failures onto the error taxonomy.
fn classify(e: InvocationError) -> Error {
    match e {
        InvocationError::Rpc(rpc) => {
            let name = rpc.name.as_str();
            if name.starts_with("FLOOD_WAIT") || name.starts_with("FLOOD_PREMIUM_WAIT") {
                return Error::RateLimited {
                    seconds: rpc.value.unwrap_or(1),
                };
            }
            if name == "CHAT_FORWARDS_RESTRICTED" {
                return Error::ForwardRestricted(name.to_string());
            }
            if matches!(
                name,
                "CHANNEL_PRIVATE"
                    | "CHAT_ADMIN_REQUIRED"
                    | "USER_BANNED_IN_CHANNEL"
                    | "CHAT_WRITE_FORBIDDEN"
                    | "CHAT_SEND_MEDIA_FORBIDDEN"
                    | "MESSAGE_DELETE_FORBIDDEN"
            ) {
                return Error::Permission(name.to_string());
            }
            if name.starts_with("AUTH_KEY")
                || matches!(name, "SESSION_REVOKED" | "SESSION_EXPIRED" | "USER_DEACTIVATED")
            {
                return Error::AuthRequired(name.to_string());
            }
            if matches!(
                name,
                "USERNAME_INVALID" | "USERNAME_NOT_OCCUPIED" | "PEER_ID_INVALID" | "CHANNEL_INVALID"
            ) {
                return Error::EntityNotFound(name.to_string());
            }
            Error::TelegramClient(format!("rpc error {}: {}", rpc.code, name))
        }
        other => Error::Network(other.to_string()),
    }
}

fn entity_from_peer(peer: Peer) -> ResolvedEntity {
    let pid = peer.id();
    let kind = match pid.kind() {
        PeerKind::User => EntityKind::User,
        PeerKind::Chat => EntityKind::Chat,
        PeerKind::Channel => EntityKind::Channel,
    };
    let title = peer
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| pid.bare_id().to_string());
    let username = peer.username().map(str::to_string);
    ResolvedEntity {
        id: pid.bare_id(),
        title,
        kind,
        username,
        peer: PeerRef::from(&peer),
    }
}

/// Snapshot a grammers message into the pool-independent form used by the
/// forwarder.
fn wrap_message(msg: &grammers_client::types::Message) -> FetchedMessage {
    let media = msg.media();
    let mut filename = None;
    let mut mime = None;
    let mut file_id = None;
    let mut file_size = 0i64;

    match &media {
        Some(grammers_client::types::Media::Document(doc)) => {
            let name = doc.name();
            if !name.is_empty() {
                filename = Some(name.to_string());
            }
            mime = doc.mime_type().map(str::to_string);
            file_id = Some(doc.id().to_string());
            file_size = doc.size();
        }
        Some(grammers_client::types::Media::Photo(photo)) => {
            mime = Some("image/jpeg".to_string());
            file_id = Some(photo.id().to_string());
        }
        _ => {}
    }

    let topic_id = match &msg.raw.reply_to {
        Some(tl::enums::MessageReplyHeader::Header(header)) if header.forum_topic => header
            .reply_to_top_id
            .or(header.reply_to_msg_id)
            .map(i64::from),
        _ => None,
    };

    FetchedMessage {
        id: msg.id(),
        sender_id: msg.sender().map(|s| s.id().bare_id()),
        sender_name: msg.sender().and_then(|s| s.name().map(str::to_string)),
        timestamp: msg.date().timestamp(),
        text: msg.text().to_string(),
        filename,
        mime,
        file_id,
        file_size,
        topic_id,
        media,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn test_session_path_appends_extension() {
        let (_dir, archive) = db::test_archive();
        let config = Arc::new(Config {
            accounts: vec![AccountConfig {
                session_name: "relay_1".into(),
                api_id: 1,
                api_hash: "0123456789abcdef0123456789abcdef".into(),
                phone_number: None,
                password: None,
            }],
            ..Config::default()
        });
        let pool = ClientPool::new(config, PathBuf::from("/tmp/sessions"), Arc::new(archive));
        assert_eq!(
            pool.session_path("relay_1"),
            PathBuf::from("/tmp/sessions/relay_1.session")
        );
        // Dots in the name must not be treated as an extension boundary.
        assert_eq!(
            pool.session_path("relay.v2"),
            PathBuf::from("/tmp/sessions/relay.v2.session")
        );
    }
}
