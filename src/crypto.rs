/*!
VTun加密模块

提供隧道负载的对称加密功能，包括：
- AES-CBC加密（每个数据包使用随机IV）
- PKCS7填充
- 不加密的透传模式（调试和互通使用）
*/

use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// AES分组长度
pub const BLOCK_SIZE: usize = 16;

/// 加密错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("invalid key size {0}, expected 16, 24 or 32")]
    InvalidKeyLength(usize),

    #[error("invalid cipher data size {0}")]
    InvalidCiphertext(usize),
}

/// 加密算法类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherKind {
    #[default]
    Aes,
    None,
}

/// AES-CBC加密上下文
///
/// 密文格式为 `IV || CBC(PKCS7(data))`，IV每次加密随机生成。
/// 密钥长度决定使用AES-128/192/256。
pub struct AesCbc {
    key: Vec<u8>,
}

impl AesCbc {
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        match key.len() {
            16 | 24 | 32 => Ok(Self { key: key.to_vec() }),
            n => Err(CipherError::InvalidKeyLength(n)),
        }
    }

    /// 加密数据
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut iv = [0u8; BLOCK_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let body = match self.key.len() {
            16 => cbc_encrypt::<Aes128>(&self.key, &iv, data)?,
            24 => cbc_encrypt::<Aes192>(&self.key, &iv, data)?,
            32 => cbc_encrypt::<Aes256>(&self.key, &iv, data)?,
            n => return Err(CipherError::InvalidKeyLength(n)),
        };

        let mut out = Vec::with_capacity(BLOCK_SIZE + body.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// 解密数据
    ///
    /// 填充长度超过数据长度时（通常是密钥错误）返回空数据而不是错误。
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        if data.len() < BLOCK_SIZE || data.len() % BLOCK_SIZE != 0 {
            return Err(CipherError::InvalidCiphertext(data.len()));
        }

        let (iv, body) = data.split_at(BLOCK_SIZE);
        let out = match self.key.len() {
            16 => cbc_decrypt::<Aes128>(&self.key, iv, body)?,
            24 => cbc_decrypt::<Aes192>(&self.key, iv, body)?,
            32 => cbc_decrypt::<Aes256>(&self.key, iv, body)?,
            n => return Err(CipherError::InvalidKeyLength(n)),
        };

        Ok(pkcs7_unpad(out))
    }
}

fn cbc_encrypt<C>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, CipherError>
where
    C: BlockEncryptMut + BlockCipher + KeyInit,
{
    let encryptor = cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
    Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(data))
}

/// 只做CBC解密，填充由 [`pkcs7_unpad`] 宽松处理
fn cbc_decrypt<C>(key: &[u8], iv: &[u8], body: &[u8]) -> Result<Vec<u8>, CipherError>
where
    C: BlockDecryptMut + BlockCipher + KeyInit,
{
    let decryptor = cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
    decryptor
        .decrypt_padded_vec_mut::<NoPadding>(body)
        .map_err(|_| CipherError::InvalidCiphertext(body.len() + BLOCK_SIZE))
}

impl fmt::Debug for AesCbc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesCbc")
            .field("key_len", &self.key.len())
            .finish()
    }
}

/// 负载加密器
#[derive(Debug)]
pub enum Cipher {
    /// AES-CBC
    Aes(AesCbc),
    /// 不加密，原样传输
    Plain,
}

impl Cipher {
    /// 创建加密器，`CipherKind::None` 时忽略密钥
    pub fn new(kind: CipherKind, key: &[u8]) -> Result<Self, CipherError> {
        match kind {
            CipherKind::Aes => Ok(Cipher::Aes(AesCbc::new(key)?)),
            CipherKind::None => Ok(Cipher::Plain),
        }
    }

    /// 加密算法类型
    pub fn kind(&self) -> CipherKind {
        match self {
            Cipher::Aes(_) => CipherKind::Aes,
            Cipher::Plain => CipherKind::None,
        }
    }

    /// 加密数据，空数据原样返回
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }

        match self {
            Cipher::Aes(aes) => aes.encrypt(data),
            Cipher::Plain => Ok(data.to_vec()),
        }
    }

    /// 解密数据，空数据原样返回
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }

        match self {
            Cipher::Aes(aes) => aes.decrypt(data),
            Cipher::Plain => Ok(data.to_vec()),
        }
    }
}

/// 去掉PKCS7填充，填充长度超过数据长度时返回空数据
fn pkcs7_unpad(mut data: Vec<u8>) -> Vec<u8> {
    let Some(&last) = data.last() else {
        return data;
    };

    let pad = last as usize;
    if pad > data.len() {
        return Vec::new();
    }

    data.truncate(data.len() - pad);
    data
}
