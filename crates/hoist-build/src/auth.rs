//! レジストリ認証処理
//!
//! Docker config.json から認証情報を取得し、Bollard の DockerCredentials に変換します。

use crate::error::{BuildError, BuildResult};
use crate::reference::ImageReference;
use base64::Engine;
use bollard::auth::DockerCredentials;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// レジストリの認証情報ストア
///
/// ビルドでは全レジストリ分、プッシュでは対象レジストリ1件分だけを取り出す。
pub trait CredentialStore {
    /// 既知の全レジストリの認証情報（キーはレジストリホスト、Docker Hub のみ旧来のキー）
    fn all_auth_configs(&self) -> anyhow::Result<HashMap<String, DockerCredentials>>;

    /// イメージ参照のレジストリに対応する認証情報
    fn auth_config_for_reference(
        &self,
        reference: &ImageReference,
    ) -> anyhow::Result<Option<DockerCredentials>>;
}

/// Docker config.json の構造
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfig {
    /// 認証情報 (レジストリ -> AuthEntry)
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    /// credential helper 名 (例: "osxkeychain", "desktop")
    #[serde(default)]
    creds_store: Option<String>,
    /// レジストリごとの credential helper
    #[serde(default)]
    cred_helpers: HashMap<String, String>,
}

/// 認証エントリ
#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    /// Base64エンコードされた "username:password"
    auth: Option<String>,
    identitytoken: Option<String>,
    registrytoken: Option<String>,
}

/// credential helper からのレスポンス
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialResponse {
    username: String,
    secret: String,
}

/// identity token を表す credential helper のユーザー名
const TOKEN_USERNAME: &str = "<token>";

/// Docker Hub の config.json 上のキー
const DOCKER_HUB_AUTH_KEY: &str = "https://index.docker.io/v1/";

/// レジストリ認証を管理
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    config_path: PathBuf,
}

impl Default for RegistryAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryAuth {
    /// 新しい RegistryAuth を作成
    ///
    /// `DOCKER_CONFIG` が無ければ ~/.docker/config.json を使用
    pub fn new() -> Self {
        let config_path = std::env::var("DOCKER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".docker"))
                    .unwrap_or_else(|| PathBuf::from(".docker"))
            })
            .join("config.json");

        Self { config_path }
    }

    /// 指定したパスの config.json を使用
    pub fn with_config_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// レジストリの認証情報を取得
    ///
    /// # Returns
    /// * `Ok(Some(credentials))` - 認証情報が見つかった場合
    /// * `Ok(None)` - 認証情報が登録されていない場合（匿名でアクセス）
    /// * `Err(e)` - config.json や credential helper の読み取りに失敗した場合
    pub fn get_credentials(&self, registry: &str) -> BuildResult<Option<DockerCredentials>> {
        let Some(config) = self.load_docker_config()? else {
            return Ok(None);
        };

        self.credentials_for(&config, registry)
    }

    /// 全レジストリの認証情報を取得
    pub fn get_all_credentials(&self) -> BuildResult<HashMap<String, DockerCredentials>> {
        let Some(config) = self.load_docker_config()? else {
            return Ok(HashMap::new());
        };

        let mut registries: Vec<String> = config.auths.keys().cloned().collect();
        registries.extend(config.cred_helpers.keys().cloned());
        if let Some(helper) = &config.creds_store {
            registries.extend(self.list_from_helper(helper)?);
        }

        // キーは daemon が X-Registry-Config で期待する形にする
        let mut all = HashMap::new();
        for registry in registries {
            let host = normalize_registry(&registry);
            let key = auth_config_key(&host).to_string();
            if all.contains_key(&key) {
                continue;
            }
            if let Some(creds) = self.credentials_for(&config, &host)? {
                all.insert(key, creds);
            }
        }

        tracing::debug!("Loaded credentials for {} registries", all.len());
        Ok(all)
    }

    fn credentials_for(
        &self,
        config: &DockerConfig,
        registry: &str,
    ) -> BuildResult<Option<DockerCredentials>> {
        // 1. レジストリ専用の credential helper
        if let Some(helper) = config.cred_helpers.get(registry) {
            tracing::debug!("Trying credential helper {} for {}", helper, registry);
            return self.get_from_helper(helper, registry);
        }

        // 2. auths セクション
        if let Some(auth_entry) = find_auth_entry(config, registry)
            && let Some(creds) = self.decode_auth(auth_entry, registry)?
        {
            tracing::debug!("Found credentials in auths for {}", registry);
            return Ok(Some(creds));
        }

        // 3. 共通の credential helper
        if let Some(helper) = &config.creds_store {
            tracing::debug!("Trying credential helper: {}", helper);
            return self.get_from_helper(helper, registry);
        }

        tracing::debug!("No credentials found for {}", registry);
        Ok(None)
    }

    /// Docker config.json を読み込み（存在しなければ None）
    fn load_docker_config(&self) -> BuildResult<Option<DockerConfig>> {
        if !self.config_path.exists() {
            tracing::debug!("Docker config.json not found at {:?}", self.config_path);
            return Ok(None);
        }

        let content =
            std::fs::read_to_string(&self.config_path).map_err(|e| BuildError::AuthFailed {
                registry: self.config_path.display().to_string(),
                message: format!("Failed to read config.json: {}", e),
            })?;

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| BuildError::AuthFailed {
                registry: self.config_path.display().to_string(),
                message: format!("Failed to parse config.json: {}", e),
            })
    }

    /// Base64エンコードされた認証情報をデコード
    fn decode_auth(
        &self,
        entry: &AuthEntry,
        registry: &str,
    ) -> BuildResult<Option<DockerCredentials>> {
        let mut creds = DockerCredentials {
            serveraddress: Some(registry.to_string()),
            identitytoken: entry.identitytoken.clone(),
            registrytoken: entry.registrytoken.clone(),
            ..Default::default()
        };

        if let Some(auth_b64) = &entry.auth {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(auth_b64)
                .map_err(|e| BuildError::AuthFailed {
                    registry: registry.to_string(),
                    message: format!("Failed to decode auth: {}", e),
                })?;

            let auth_str = String::from_utf8(decoded).map_err(|e| BuildError::AuthFailed {
                registry: registry.to_string(),
                message: format!("Invalid UTF-8 in auth: {}", e),
            })?;

            let (username, password) =
                auth_str
                    .split_once(':')
                    .ok_or_else(|| BuildError::AuthFailed {
                        registry: registry.to_string(),
                        message: "auth is not in username:password form".to_string(),
                    })?;
            creds.username = Some(username.to_string());
            creds.password = Some(password.to_string());
        }

        if creds.username.is_none() && creds.identitytoken.is_none() && creds.registrytoken.is_none()
        {
            return Ok(None);
        }
        Ok(Some(creds))
    }

    /// credential helper から認証情報を取得
    fn get_from_helper(
        &self,
        helper: &str,
        registry: &str,
    ) -> BuildResult<Option<DockerCredentials>> {
        // Docker Hub は helper 側では旧来のキーで登録されている
        let server = auth_config_key(registry);
        let output = self.run_helper(helper, "get", Some(server), registry)?;

        if !output.status.success() {
            // credential helper が認証情報を持っていない場合は None を返す
            tracing::debug!(
                "Credential helper returned error for {}: {}",
                registry,
                String::from_utf8_lossy(&output.stderr)
            );
            return Ok(None);
        }

        let response: CredentialResponse =
            serde_json::from_slice(&output.stdout).map_err(|e| BuildError::AuthFailed {
                registry: registry.to_string(),
                message: format!("Failed to parse credential helper response: {}", e),
            })?;

        let mut creds = DockerCredentials {
            serveraddress: Some(registry.to_string()),
            ..Default::default()
        };
        if response.username == TOKEN_USERNAME {
            creds.identitytoken = Some(response.secret);
        } else {
            creds.username = Some(response.username);
            creds.password = Some(response.secret);
        }
        Ok(Some(creds))
    }

    /// credential helper に登録されているレジストリ一覧
    fn list_from_helper(&self, helper: &str) -> BuildResult<Vec<String>> {
        let output = self.run_helper(helper, "list", None, helper)?;
        if !output.status.success() {
            return Err(BuildError::AuthFailed {
                registry: helper.to_string(),
                message: format!(
                    "Credential helper list failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let servers: HashMap<String, String> =
            serde_json::from_slice(&output.stdout).map_err(|e| BuildError::AuthFailed {
                registry: helper.to_string(),
                message: format!("Failed to parse credential helper list: {}", e),
            })?;
        Ok(servers.into_keys().collect())
    }

    fn run_helper(
        &self,
        helper: &str,
        action: &str,
        input: Option<&str>,
        registry: &str,
    ) -> BuildResult<std::process::Output> {
        let helper_cmd = format!("docker-credential-{}", helper);

        let mut child = Command::new(&helper_cmd)
            .arg(action)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BuildError::AuthFailed {
                registry: registry.to_string(),
                message: format!("Failed to run {}: {}", helper_cmd, e),
            })?;

        // レジストリ名を stdin に渡す
        if let Some(stdin) = child.stdin.take()
            && let Some(input) = input
        {
            if let Err(e) = write_helper_input(stdin, input, &helper_cmd, registry) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        }

        child
            .wait_with_output()
            .map_err(|e| BuildError::AuthFailed {
                registry: registry.to_string(),
                message: format!("Credential helper failed: {}", e),
            })
    }
}

impl CredentialStore for RegistryAuth {
    fn all_auth_configs(&self) -> anyhow::Result<HashMap<String, DockerCredentials>> {
        Ok(self.get_all_credentials()?)
    }

    fn auth_config_for_reference(
        &self,
        reference: &ImageReference,
    ) -> anyhow::Result<Option<DockerCredentials>> {
        Ok(self.get_credentials(reference.registry())?)
    }
}

/// credential helper の stdin にサーバー名を書き込む
fn write_helper_input<W: Write>(
    mut stdin: W,
    input: &str,
    helper_cmd: &str,
    registry: &str,
) -> BuildResult<()> {
    stdin
        .write_all(input.as_bytes())
        .and_then(|_| stdin.flush())
        .map_err(|e| BuildError::AuthFailed {
            registry: registry.to_string(),
            message: format!("Failed to write to {}: {}", helper_cmd, e),
        })
}

/// レジストリホストを daemon 向けの認証設定キーにする
///
/// Docker Hub だけは旧来の `https://index.docker.io/v1/` で渡す。
fn auth_config_key(host: &str) -> &str {
    if host == crate::reference::DEFAULT_REGISTRY {
        DOCKER_HUB_AUTH_KEY
    } else {
        host
    }
}

/// config.json のキーをレジストリホストに揃える
///
/// `https://index.docker.io/v1/` -> `docker.io`, `https://ghcr.io` -> `ghcr.io`
fn normalize_registry(key: &str) -> String {
    let host = key
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next().unwrap_or(host);

    match host {
        "index.docker.io" | "registry-1.docker.io" => {
            crate::reference::DEFAULT_REGISTRY.to_string()
        }
        _ => host.to_string(),
    }
}

fn find_auth_entry<'a>(config: &'a DockerConfig, registry: &str) -> Option<&'a AuthEntry> {
    config.auths.get(registry).or_else(|| {
        config
            .auths
            .iter()
            .find(|(key, _)| normalize_registry(key) == registry)
            .map(|(_, entry)| entry)
    })
}
