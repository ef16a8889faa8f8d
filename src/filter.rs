use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, info};
use std::collections::HashSet;
use std::path::Path;
use std::time::Instant;

use crate::error::Result;

/// 黑名单规则匹配（只读）
pub trait FilterMatcher: Send + Sync {
    /// `uri` 是带协议的完整地址，例如 `https://example.com:443`
    fn matches(&self, uri: &str) -> bool;
}

/// 不匹配任何地址
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFilter;

impl FilterMatcher for NoopFilter {
    fn matches(&self, _uri: &str) -> bool {
        false
    }
}

/// 基于域名的黑名单
///
/// 只支持 Adblock 规则中描述域名的那部分写法：`||domain`、`|http://domain/...`、
/// `.domain` 和裸域名，命中规则本身或其任意子域名。注释、`[...]` 头、
/// `@@` 例外规则、正则规则和带通配符的规则被忽略。
#[derive(Debug, Clone, Default)]
pub struct DomainListFilter {
    domains: HashSet<String>,
}

impl DomainListFilter {
    pub fn from_rules(text: &str) -> Self {
        let domains: HashSet<String> = text.lines().filter_map(parse_rule).collect();
        info!("加载了 {} 条域名规则", domains.len());
        Self { domains }
    }

    /// 读取规则文件，整体是 base64 时（gfwlist 发布格式）先解码
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let text = decode_base64_body(&raw).unwrap_or(raw);
        Ok(Self::from_rules(&text))
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    fn matches_host(&self, host: &str) -> bool {
        let mut candidate = host;
        loop {
            if self.domains.contains(candidate) {
                return true;
            }
            match candidate.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => candidate = parent,
                _ => return false,
            }
        }
    }
}

impl FilterMatcher for DomainListFilter {
    fn matches(&self, uri: &str) -> bool {
        let start = Instant::now();
        let hit = host_of(uri)
            .map(|host| self.matches_host(&host))
            .unwrap_or(false);
        debug!("gfw-query: {} - {:?}", uri, start.elapsed());
        hit
    }
}

fn host_of(uri: &str) -> Option<String> {
    let with_scheme = if uri.contains("://") {
        uri.to_string()
    } else {
        format!("http://{}", uri)
    };
    url::Url::parse(&with_scheme)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_end_matches('.').to_lowercase()))
}

fn parse_rule(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty()
        || line.starts_with('!')
        || line.starts_with("@@")
        || (line.starts_with('[') && line.ends_with(']'))
        || (line.len() > 1 && line.starts_with('/') && line.ends_with('/'))
    {
        return None;
    }

    let domain = if let Some(rest) = line.strip_prefix("||") {
        rest.to_string()
    } else if let Some(rest) = line.strip_prefix('|') {
        host_of(rest)?
    } else if let Some(rest) = line.strip_prefix('.') {
        rest.to_string()
    } else {
        line.to_string()
    };

    let domain = domain
        .split(['^', '/', ':', '$'])
        .next()
        .unwrap_or("")
        .trim_end_matches('.')
        .to_lowercase();

    let valid = domain.contains('.')
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if valid {
        Some(domain)
    } else {
        None
    }
}

fn decode_base64_body(raw: &str) -> Option<String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }
    let bytes = STANDARD.decode(compact.as_bytes()).ok()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = "[AutoProxy 0.2.9]
! Checksum: xxx
||google.com
|http://blocked.example.org/path
.twitter.com
facebook.com
@@||allowed.google.com
/^https?:\\/\\/[^\\/]+blogspot\\.(.*)/
*.wild.example
||youtube.com^
";

    #[test]
    fn test_parse_rules() {
        let filter = DomainListFilter::from_rules(RULES);
        assert_eq!(filter.len(), 5);
        assert!(!filter.is_empty());
    }

    #[test]
    fn test_matches_domain_and_subdomains() {
        let filter = DomainListFilter::from_rules(RULES);

        assert!(filter.matches("https://google.com"));
        assert!(filter.matches("https://www.google.com:443"));
        assert!(filter.matches("http://blocked.example.org/other"));
        assert!(filter.matches("https://api.twitter.com"));
        assert!(filter.matches("https://m.facebook.com/"));
        assert!(filter.matches("https://www.youtube.com"));
        assert!(filter.matches("WWW.GOOGLE.COM"));

        assert!(!filter.matches("https://notgoogle.com"));
        assert!(!filter.matches("https://example.org"));
        assert!(!filter.matches("https://wild.example"));
        assert!(!filter.matches("not a uri"));
    }

    #[test]
    fn test_noop_filter() {
        assert!(!NoopFilter.matches("https://google.com"));
    }

    #[test]
    fn test_load_base64_list() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let encoded = STANDARD.encode(RULES);
        // gfwlist 按 64 列换行
        let wrapped: Vec<String> = encoded
            .as_bytes()
            .chunks(64)
            .map(|c| String::from_utf8(c.to_vec()).unwrap())
            .collect();
        std::fs::write(file.path(), wrapped.join("\n")).unwrap();

        let filter = DomainListFilter::load(file.path()).unwrap();
        assert_eq!(filter.len(), 5);
        assert!(filter.matches("https://google.com"));

        std::fs::write(file.path(), "||plain.example.com\n").unwrap();
        let plain = DomainListFilter::load(file.path()).unwrap();
        assert!(plain.matches("https://a.plain.example.com"));
    }
}
