/*!
VTun Server 认证模块

管理隧道用户，包括：
- 用户凭据校验
- 登录状态（每个用户同时只允许一个会话）
- 用户文件的增加和列举
*/

use base64::Engine;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// 认证错误
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("user {0} not exist")]
    UnknownUser(String),

    #[error("wrong passwd for user {0}")]
    WrongPassword(String),

    #[error("user {0} already logged in")]
    AlreadyLoggedIn(String),

    #[error("user {0} existed")]
    UserExists(String),

    #[error("invalid username {0}")]
    InvalidUsername(String),
}

/// 凭据存储
pub trait CredentialStore: Send + Sync {
    /// 校验用户名和密码，成功后用户进入登录状态
    fn validate(&self, user: &str, passwd: &str) -> Result<(), AuthError>;

    /// 退出登录，未登录时无操作
    fn logout(&self, user: &str);

    fn add(&self, user: &str, passwd: &str) -> Result<(), AuthError>;

    fn list(&self) -> Result<Vec<String>, AuthError>;
}

/// 基于文件的凭据存储
///
/// 每行一个用户：`<user>,<base64(passwd)>`。
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    logged_in: Mutex<HashSet<String>>,
}

impl FileCredentialStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            logged_in: Mutex::new(HashSet::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取全部用户，文件不存在时视为空
    fn users(&self) -> Result<Vec<(String, String)>, AuthError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(content
            .lines()
            .filter_map(|line| line.trim().split_once(','))
            .map(|(user, passwd)| (user.to_string(), passwd.to_string()))
            .collect())
    }

    fn is_logged_in(&self, user: &str) -> bool {
        self.logged_in
            .lock()
            .map(|users| users.contains(user))
            .unwrap_or(false)
    }
}

fn encode_passwd(passwd: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(passwd.as_bytes())
}

impl CredentialStore for FileCredentialStore {
    fn validate(&self, user: &str, passwd: &str) -> Result<(), AuthError> {
        if self.is_logged_in(user) {
            return Err(AuthError::AlreadyLoggedIn(user.to_string()));
        }

        let (_, stored) = self
            .users()?
            .into_iter()
            .find(|(name, _)| name == user)
            .ok_or_else(|| AuthError::UnknownUser(user.to_string()))?;

        if stored != encode_passwd(passwd) {
            return Err(AuthError::WrongPassword(user.to_string()));
        }

        if let Ok(mut users) = self.logged_in.lock() {
            if !users.insert(user.to_string()) {
                return Err(AuthError::AlreadyLoggedIn(user.to_string()));
            }
        }

        Ok(())
    }

    fn logout(&self, user: &str) {
        if let Ok(mut users) = self.logged_in.lock() {
            if users.remove(user) {
                log::info!("User {} logged out", user);
            }
        }
    }

    fn add(&self, user: &str, passwd: &str) -> Result<(), AuthError> {
        if user.is_empty() || user.contains(',') || user.contains('/') {
            return Err(AuthError::InvalidUsername(user.to_string()));
        }

        if self.users()?.iter().any(|(name, _)| name == user) {
            return Err(AuthError::UserExists(user.to_string()));
        }

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&self.path)?;
        writeln!(file, "{},{}", user, encode_passwd(passwd))?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, AuthError> {
        Ok(self.users()?.into_iter().map(|(user, _)| user).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, FileCredentialStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("users"));
        (dir, store)
    }

    #[test]
    fn add_and_list_users() {
        let (_dir, store) = store();
        assert!(store.list().unwrap().is_empty());

        store.add("alice", "secret1234").unwrap();
        store.add("bob", "hunter2").unwrap();
        assert_eq!(store.list().unwrap(), vec!["alice", "bob"]);

        let content = fs::read_to_string(store.path()).unwrap();
        assert_eq!(content, "alice,c2VjcmV0MTIzNA==\nbob,aHVudGVyMg==\n");
    }

    #[test]
    fn reject_duplicate_and_invalid_users() {
        let (_dir, store) = store();
        store.add("alice", "secret1234").unwrap();
        assert!(matches!(
            store.add("alice", "other"),
            Err(AuthError::UserExists(_))
        ));
        for user in ["", "a,b", "a/b"] {
            assert!(matches!(
                store.add(user, "x"),
                Err(AuthError::InvalidUsername(_))
            ));
        }
    }

    #[test]
    fn validate_credentials() {
        let (_dir, store) = store();
        store.add("alice", "secret1234").unwrap();

        assert!(matches!(
            store.validate("carol", "secret1234"),
            Err(AuthError::UnknownUser(_))
        ));
        assert!(matches!(
            store.validate("alice", "wrong"),
            Err(AuthError::WrongPassword(_))
        ));
        store.validate("alice", "secret1234").unwrap();
    }

    #[test]
    fn one_session_per_user() {
        let (_dir, store) = store();
        store.add("alice", "secret1234").unwrap();

        store.validate("alice", "secret1234").unwrap();
        let err = store.validate("alice", "secret1234").unwrap_err();
        assert_eq!(err.to_string(), "user alice already logged in");

        store.logout("alice");
        store.logout("alice");
        store.validate("alice", "secret1234").unwrap();
    }
}
