use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::HeaderValue, Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;

use crate::models::{ChannelAccess, MemberSnapshot, Role};
use crate::services::gateway::{GatewayError, GuildGateway};

const ADMINISTRATOR: u64 = 1 << 3;
const VIEW_CHANNEL: u64 = 1 << 10;

const CHANNEL_TYPE_CATEGORY: u8 = 4;
const OVERWRITE_TYPE_ROLE: u8 = 0;
const OVERWRITE_TYPE_MEMBER: u8 = 1;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Guild gateway backed by the Discord REST API.
#[derive(Clone)]
pub struct DiscordGateway {
    client: Client,
    base_url: String,
    token: Secret<String>,
}

#[derive(Debug, Deserialize)]
struct ApiGuild {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: String,
    username: String,
    global_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMember {
    user: ApiUser,
    nick: Option<String>,
    roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiRole {
    id: String,
    name: String,
    position: i32,
    permissions: String,
}

#[derive(Debug, Deserialize)]
struct ApiOverwrite {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    allow: String,
    deny: String,
}

#[derive(Debug, Deserialize)]
struct ApiChannel {
    id: String,
    name: Option<String>,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    permission_overwrites: Vec<ApiOverwrite>,
}

#[derive(Debug, Deserialize)]
struct ApiDmChannel {
    id: String,
}

#[derive(Debug, Serialize)]
struct OverwriteBody {
    #[serde(rename = "type")]
    kind: u8,
    allow: String,
    deny: String,
}

/// A parsed permission overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Overwrite {
    pub id: i64,
    pub kind: u8,
    pub allow: u64,
    pub deny: u64,
}

impl DiscordGateway {
    pub fn new(base_url: &str, token: Secret<String>) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header(
                "Authorization",
                format!("Bot {}", self.token.expose_secret()),
            )
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        let response = check(self.request(reqwest::Method::GET, path).send().await?).await?;
        Ok(response.json().await?)
    }

    async fn fetch_roles(&self, guild_id: i64) -> Result<Vec<ApiRole>, GatewayError> {
        self.get_json(&format!("/guilds/{}/roles", guild_id)).await
    }

    async fn fetch_member(
        &self,
        guild_id: i64,
        user_id: i64,
    ) -> Result<Option<ApiMember>, GatewayError> {
        match self
            .get_json::<ApiMember>(&format!("/guilds/{}/members/{}", guild_id, user_id))
            .await
        {
            Ok(member) => Ok(Some(member)),
            Err(GatewayError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn fetch_channel(&self, channel_id: i64) -> Result<ApiChannel, GatewayError> {
        self.get_json(&format!("/channels/{}", channel_id)).await
    }
}

#[async_trait]
impl GuildGateway for DiscordGateway {
    async fn ping(&self) -> Result<(), GatewayError> {
        check(self.request(reqwest::Method::GET, "/users/@me").send().await?).await?;
        Ok(())
    }

    async fn guild_name(&self, guild_id: i64) -> Result<String, GatewayError> {
        let guild: ApiGuild = self.get_json(&format!("/guilds/{}", guild_id)).await?;
        Ok(guild.name)
    }

    async fn member(
        &self,
        guild_id: i64,
        user_id: i64,
    ) -> Result<Option<MemberSnapshot>, GatewayError> {
        let Some(member) = self.fetch_member(guild_id, user_id).await? else {
            return Ok(None);
        };

        // The API omits the base role; every member holds it implicitly
        let mut role_ids = vec![guild_id];
        for raw in &member.roles {
            role_ids.push(snowflake(raw)?);
        }

        let display_name = member
            .nick
            .or(member.user.global_name)
            .unwrap_or(member.user.username);

        Ok(Some(MemberSnapshot {
            user_id: snowflake(&member.user.id)?,
            display_name,
            role_ids,
        }))
    }

    async fn roles(&self, guild_id: i64) -> Result<Vec<Role>, GatewayError> {
        self.fetch_roles(guild_id)
            .await?
            .into_iter()
            .map(|role| {
                Ok(Role {
                    id: snowflake(&role.id)?,
                    name: role.name,
                    position: role.position,
                })
            })
            .collect()
    }

    async fn channels(
        &self,
        guild_id: i64,
        user_id: i64,
    ) -> Result<Vec<ChannelAccess>, GatewayError> {
        let member = self
            .fetch_member(guild_id, user_id)
            .await?
            .ok_or(GatewayError::NotFound)?;
        let member_roles = member
            .roles
            .iter()
            .map(|raw| snowflake(raw))
            .collect::<Result<Vec<_>, _>>()?;

        let mut role_permissions = HashMap::new();
        for role in self.fetch_roles(guild_id).await? {
            role_permissions.insert(snowflake(&role.id)?, bitfield(&role.permissions)?);
        }

        let channels: Vec<ApiChannel> = self
            .get_json(&format!("/guilds/{}/channels", guild_id))
            .await?;

        channels
            .into_iter()
            .map(|channel| {
                let overwrites = parse_overwrites(&channel.permission_overwrites)?;
                let own_override = overwrites
                    .iter()
                    .find(|o| o.kind == OVERWRITE_TYPE_MEMBER && o.id == user_id)
                    .and_then(|o| read_bit((o.allow, o.deny)));
                Ok(ChannelAccess {
                    id: snowflake(&channel.id)?,
                    name: channel.name.unwrap_or_default(),
                    is_category: channel.kind == CHANNEL_TYPE_CATEGORY,
                    can_read: can_view(
                        guild_id,
                        user_id,
                        &role_permissions,
                        &member_roles,
                        &overwrites,
                    ),
                    own_override,
                })
            })
            .collect()
    }

    async fn add_role(
        &self,
        guild_id: i64,
        user_id: i64,
        role_id: i64,
        reason: &str,
    ) -> Result<(), GatewayError> {
        let path = format!("/guilds/{}/members/{}/roles/{}", guild_id, user_id, role_id);
        let request = with_reason(self.request(reqwest::Method::PUT, &path), reason);
        check(request.send().await?).await?;
        Ok(())
    }

    async fn remove_role(
        &self,
        guild_id: i64,
        user_id: i64,
        role_id: i64,
        reason: &str,
    ) -> Result<(), GatewayError> {
        let path = format!("/guilds/{}/members/{}/roles/{}", guild_id, user_id, role_id);
        let request = with_reason(self.request(reqwest::Method::DELETE, &path), reason);
        check(request.send().await?).await?;
        Ok(())
    }

    async fn set_read_override(
        &self,
        guild_id: i64,
        channel_id: i64,
        user_id: i64,
        read: Option<bool>,
        reason: &str,
    ) -> Result<(), GatewayError> {
        let channel = self.fetch_channel(channel_id).await?;
        let current = parse_overwrites(&channel.permission_overwrites)?
            .into_iter()
            .find(|o| o.kind == OVERWRITE_TYPE_MEMBER && o.id == user_id);

        let (allow, deny) = with_read_bit(
            current.map(|o| (o.allow, o.deny)).unwrap_or((0, 0)),
            read,
        );

        tracing::debug!(
            guild_id = guild_id,
            channel_id = channel_id,
            user_id = user_id,
            ?read,
            "Updating member channel override"
        );

        let path = format!("/channels/{}/permissions/{}", channel_id, user_id);

        if allow == 0 && deny == 0 {
            if current.is_none() {
                return Ok(());
            }
            let request = with_reason(self.request(reqwest::Method::DELETE, &path), reason);
            return match check(request.send().await?).await {
                Ok(_) | Err(GatewayError::NotFound) => Ok(()),
                Err(e) => Err(e),
            };
        }

        let body = OverwriteBody {
            kind: OVERWRITE_TYPE_MEMBER,
            allow: allow.to_string(),
            deny: deny.to_string(),
        };
        let request = with_reason(self.request(reqwest::Method::PUT, &path), reason).json(&body);
        check(request.send().await?).await?;
        Ok(())
    }

    async fn send_direct_message(&self, user_id: i64, content: &str) -> Result<(), GatewayError> {
        let response = check(
            self.request(reqwest::Method::POST, "/users/@me/channels")
                .json(&json!({ "recipient_id": user_id.to_string() }))
                .send()
                .await?,
        )
        .await?;
        let dm: ApiDmChannel = response.json().await?;

        check(
            self.request(reqwest::Method::POST, &format!("/channels/{}/messages", dm.id))
                .json(&json!({ "content": content }))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }
}

/// Maps non-success responses onto gateway errors
async fn check(response: Response) -> Result<Response, GatewayError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::FORBIDDEN => Err(GatewayError::PermissionDenied),
        StatusCode::NOT_FOUND => Err(GatewayError::NotFound),
        status => {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!(status = %status, body = %message, "Guild API request failed");
            Err(GatewayError::Api { status, message })
        }
    }
}

/// Attaches an audit log reason when it is a valid header value
fn with_reason(request: RequestBuilder, reason: &str) -> RequestBuilder {
    match HeaderValue::from_str(reason) {
        Ok(value) if !reason.is_empty() => request.header("X-Audit-Log-Reason", value),
        _ => request,
    }
}

fn snowflake(raw: &str) -> Result<i64, GatewayError> {
    raw.parse().map_err(|_| GatewayError::Api {
        status: StatusCode::OK,
        message: format!("Invalid snowflake: {}", raw),
    })
}

fn bitfield(raw: &str) -> Result<u64, GatewayError> {
    raw.parse().map_err(|_| GatewayError::Api {
        status: StatusCode::OK,
        message: format!("Invalid permission bitfield: {}", raw),
    })
}

fn parse_overwrites(raw: &[ApiOverwrite]) -> Result<Vec<Overwrite>, GatewayError> {
    raw.iter()
        .map(|o| {
            Ok(Overwrite {
                id: snowflake(&o.id)?,
                kind: o.kind,
                allow: bitfield(&o.allow)?,
                deny: bitfield(&o.deny)?,
            })
        })
        .collect()
}

/// Replaces the view bit of an `(allow, deny)` pair, keeping every other bit
pub(crate) fn with_read_bit((allow, deny): (u64, u64), read: Option<bool>) -> (u64, u64) {
    let (allow, deny) = (allow & !VIEW_CHANNEL, deny & !VIEW_CHANNEL);
    match read {
        Some(true) => (allow | VIEW_CHANNEL, deny),
        Some(false) => (allow, deny | VIEW_CHANNEL),
        None => (allow, deny),
    }
}

/// The view bit of an `(allow, deny)` pair; `None` when neither sets it
pub(crate) fn read_bit((allow, deny): (u64, u64)) -> Option<bool> {
    if allow & VIEW_CHANNEL != 0 {
        Some(true)
    } else if deny & VIEW_CHANNEL != 0 {
        Some(false)
    } else {
        None
    }
}

/// Computes whether a member may view a channel.
///
/// Base permissions come from the base role and the member's roles; the
/// base-role overwrite applies first, then role overwrites combined, then the
/// member overwrite. Administrators see everything.
pub(crate) fn can_view(
    guild_id: i64,
    user_id: i64,
    role_permissions: &HashMap<i64, u64>,
    member_roles: &[i64],
    overwrites: &[Overwrite],
) -> bool {
    let mut permissions = role_permissions.get(&guild_id).copied().unwrap_or(0);
    for role_id in member_roles {
        permissions |= role_permissions.get(role_id).copied().unwrap_or(0);
    }

    if permissions & ADMINISTRATOR != 0 {
        return true;
    }

    if let Some(everyone) = overwrites
        .iter()
        .find(|o| o.kind == OVERWRITE_TYPE_ROLE && o.id == guild_id)
    {
        permissions &= !everyone.deny;
        permissions |= everyone.allow;
    }

    let (mut allow, mut deny) = (0u64, 0u64);
    for overwrite in overwrites
        .iter()
        .filter(|o| o.kind == OVERWRITE_TYPE_ROLE && member_roles.contains(&o.id))
    {
        allow |= overwrite.allow;
        deny |= overwrite.deny;
    }
    permissions &= !deny;
    permissions |= allow;

    if let Some(member) = overwrites
        .iter()
        .find(|o| o.kind == OVERWRITE_TYPE_MEMBER && o.id == user_id)
    {
        permissions &= !member.deny;
        permissions |= member.allow;
    }

    permissions & VIEW_CHANNEL != 0
}
