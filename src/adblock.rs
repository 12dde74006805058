use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use regex::Regex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// A rule file must carry this marker within its first 64 bytes to be
/// accepted; anything else is silently skipped.
pub const ADBLOCK_MAGIC: &[u8] = b"[Adblock Plus";
const PEEK_LEN: usize = 64;

pub const DEFAULT_MATCH_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_CHECK_FREQ: usize = 64;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("rule matching exceeded {limit:?} after {checked} pattern checks")]
    DeadlineExceeded { limit: Duration, checked: usize },
}

/// Knobs for a single `should_block` call: a wall-clock budget and how many
/// pattern evaluations go between deadline checks.
#[derive(Debug, Clone, Copy)]
pub struct MatchOptions {
    pub timeout: Duration,
    pub check_freq: usize,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_MATCH_TIMEOUT,
            check_freq: DEFAULT_CHECK_FREQ,
        }
    }
}

struct PatternRule {
    index: usize,
    regex: Regex,
    exception: bool,
}

/// Compiled AdBlock-Plus rule database. Immutable after construction;
/// reloads build a fresh instance and swap it in whole.
///
/// Plain `||domain^` rules live in hash maps keyed by domain so the common
/// case never touches a regex; everything else compiles to a pattern.
pub struct RuleSet {
    block_domains: FxHashMap<String, usize>,
    exception_domains: FxHashMap<String, usize>,
    patterns: Vec<PatternRule>,
    rule_count: usize,
}

impl RuleSet {
    pub fn empty() -> Self {
        Self {
            block_domains: FxHashMap::default(),
            exception_domains: FxHashMap::default(),
            patterns: Vec::new(),
            rule_count: 0,
        }
    }

    /// Reads, validates and compiles the given rule files. Files that cannot
    /// be read or fail the magic peek are skipped without failing the load.
    pub fn load_files(paths: &[PathBuf]) -> Self {
        let mut set = Self::empty();
        for path in paths {
            let head = match peek_file(path, PEEK_LEN) {
                Ok(head) => head,
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "skipping unreadable rule file");
                    continue;
                }
            };
            if !is_adblock_plus_format(&head) {
                debug!(path = %path.display(), "skipping file without AdBlock Plus header");
                continue;
            }

            match std::fs::read_to_string(path) {
                Ok(content) => {
                    let before = set.rule_count;
                    for line in content.lines() {
                        set.add_line(line);
                    }
                    debug!(
                        path = %path.display(),
                        rules = set.rule_count - before,
                        "rule file loaded"
                    );
                }
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "skipping unreadable rule file");
                }
            }
        }
        set
    }

    pub fn rule_count(&self) -> usize {
        self.rule_count
    }

    /// Compiles one source line, ignoring comments, headers and cosmetic
    /// (element-hiding) rules. Unparseable patterns are dropped with a log
    /// line rather than poisoning the whole set.
    fn add_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('!') || line.starts_with('[') {
            return;
        }
        if line.contains("##") || line.contains("#@#") || line.contains("#?#") {
            return;
        }

        let (exception, body) = match line.strip_prefix("@@") {
            Some(rest) => (true, rest),
            None => (false, line),
        };

        // Filter options ($third-party, $domain=..., ...) do not apply to
        // plain hostname lookups; the pattern before them still does.
        let body = match body.find('$') {
            Some(pos) => &body[..pos],
            None => body,
        };
        if body.is_empty() {
            return;
        }

        let index = self.rule_count;

        if let Some(rest) = body.strip_prefix("||") {
            let domain = rest.strip_suffix('^').unwrap_or(rest);
            if is_plain_domain(domain) {
                let domain = domain.trim_end_matches('.').to_ascii_lowercase();
                if exception {
                    self.exception_domains.entry(domain).or_insert(index);
                } else {
                    self.block_domains.entry(domain).or_insert(index);
                }
                self.rule_count += 1;
                return;
            }
        }

        match Regex::new(&pattern_to_regex(body)) {
            Ok(regex) => {
                self.patterns.push(PatternRule {
                    index,
                    regex,
                    exception,
                });
                self.rule_count += 1;
            }
            Err(err) => {
                warn!(rule = line, error = %err, "dropping uncompilable rule");
            }
        }
    }

    /// Decides whether `url` (a bare FQDN or a full URL) should be blocked.
    /// Returns the index of the first matching block rule, or `None` when no
    /// rule matches or a matching exception overrides the block.
    pub fn should_block(
        &self,
        url: &str,
        opts: &MatchOptions,
    ) -> Result<Option<usize>, MatchError> {
        if self.rule_count == 0 {
            return Ok(None);
        }

        let (host, target) = normalize_target(url);
        let deadline = Deadline::new(opts);

        let blocked = match self.lookup_domain(&self.block_domains, &host) {
            Some(index) => Some(index),
            None => self.scan_patterns(&target, false, &deadline)?,
        };
        let Some(blocked) = blocked else {
            return Ok(None);
        };

        if self.lookup_domain(&self.exception_domains, &host).is_some()
            || self.scan_patterns(&target, true, &deadline)?.is_some()
        {
            return Ok(None);
        }

        Ok(Some(blocked))
    }

    /// Walks the label suffixes of `host` so `||example.com^` also covers
    /// `ads.example.com`.
    fn lookup_domain(&self, map: &FxHashMap<String, usize>, host: &str) -> Option<usize> {
        if map.is_empty() {
            return None;
        }
        let mut current = host;
        loop {
            if let Some(&index) = map.get(current) {
                return Some(index);
            }
            match current.find('.') {
                Some(pos) => current = &current[pos + 1..],
                None => return None,
            }
        }
    }

    fn scan_patterns(
        &self,
        target: &str,
        exception: bool,
        deadline: &Deadline,
    ) -> Result<Option<usize>, MatchError> {
        for (i, rule) in self
            .patterns
            .iter()
            .filter(|r| r.exception == exception)
            .enumerate()
        {
            deadline.check(i)?;
            if rule.regex.is_match(target) {
                return Ok(Some(rule.index));
            }
        }
        Ok(None)
    }
}

struct Deadline {
    at: Instant,
    limit: Duration,
    freq: usize,
}

impl Deadline {
    fn new(opts: &MatchOptions) -> Self {
        Self {
            at: Instant::now() + opts.timeout,
            limit: opts.timeout,
            freq: opts.check_freq.max(1),
        }
    }

    fn check(&self, iteration: usize) -> Result<(), MatchError> {
        if iteration % self.freq == 0 && Instant::now() >= self.at {
            return Err(MatchError::DeadlineExceeded {
                limit: self.limit,
                checked: iteration,
            });
        }
        Ok(())
    }
}

/// Splits the input into a lowercase host (trailing dot stripped) and the
/// URL string the pattern rules run against. A bare domain is wrapped into
/// `http://domain/` so anchors behave.
fn normalize_target(input: &str) -> (String, String) {
    if input.contains("://") {
        let target = input.to_ascii_lowercase();
        let after_scheme = target.split_once("://").map(|(_, r)| r).unwrap_or(&target);
        let host = after_scheme
            .split(['/', '?', '#'])
            .next()
            .unwrap_or(after_scheme)
            .trim_end_matches('.')
            .to_string();
        (host, target)
    } else {
        let host = input.trim().trim_end_matches('.').to_ascii_lowercase();
        let target = format!("http://{host}/");
        (host, target)
    }
}

fn is_plain_domain(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_'
        })
}

/// Translates an AdBlock-Plus pattern into anchored regex syntax:
/// `*` wildcards, `^` separators, `|` end anchors, `||` domain anchors.
fn pattern_to_regex(pattern: &str) -> String {
    let mut re = String::with_capacity(pattern.len() * 2);
    let mut rest = pattern;

    if let Some(stripped) = rest.strip_prefix("||") {
        re.push_str(r"^[a-z][a-z0-9+.-]*://(?:[^/?#]*\.)?");
        rest = stripped;
    } else if let Some(stripped) = rest.strip_prefix('|') {
        re.push('^');
        rest = stripped;
    }

    let trailing_anchor = rest.ends_with('|');
    if trailing_anchor {
        rest = &rest[..rest.len() - 1];
    }

    for ch in rest.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '^' => re.push_str(r"(?:[^a-z0-9_.%-]|$)"),
            ch if ch.is_ascii_alphanumeric() => re.push(ch.to_ascii_lowercase()),
            ch => {
                let escaped = regex::escape(&ch.to_string());
                re.push_str(&escaped);
            }
        }
    }

    if trailing_anchor {
        re.push('$');
    }
    re
}

/// Reads up to `peek_size` bytes from the head of a file.
pub fn peek_file(path: &Path, peek_size: usize) -> io::Result<Vec<u8>> {
    let mut fh = File::open(path)?;
    let mut buf = vec![0u8; peek_size];
    let mut read = 0;
    while read < buf.len() {
        match fh.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(read);
    Ok(buf)
}

pub fn is_adblock_plus_format(head: &[u8]) -> bool {
    head.windows(ADBLOCK_MAGIC.len())
        .any(|w| w == ADBLOCK_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn ruleset_from(lines: &str) -> RuleSet {
        let mut set = RuleSet::empty();
        for line in lines.lines() {
            set.add_line(line);
        }
        set
    }

    fn opts() -> MatchOptions {
        MatchOptions::default()
    }

    #[test]
    fn comments_headers_and_cosmetic_rules_are_ignored() {
        let set = ruleset_from(
            "[Adblock Plus 2.0]\n\
             ! a comment\n\
             example.com##.ad-banner\n\
             ||ads.example.com^\n",
        );
        assert_eq!(set.rule_count(), 1);
    }

    #[test]
    fn domain_rule_blocks_host_and_subdomains() {
        let set = ruleset_from("||example.com^\n");

        assert!(set.should_block("example.com", &opts()).unwrap().is_some());
        assert!(set
            .should_block("ads.example.com", &opts())
            .unwrap()
            .is_some());
        assert!(set.should_block("example.org", &opts()).unwrap().is_none());
        assert!(set
            .should_block("notexample.com", &opts())
            .unwrap()
            .is_none());
    }

    #[test]
    fn trailing_dot_is_stripped_before_matching() {
        let set = ruleset_from("||ads.example.com^\n");
        assert!(set
            .should_block("ads.example.com.", &opts())
            .unwrap()
            .is_some());
    }

    #[test]
    fn wildcard_pattern_matches_inside_a_url() {
        let set = ruleset_from("*/banner/*\n");
        assert!(set
            .should_block("http://cdn.example.com/banner/ad.png", &opts())
            .unwrap()
            .is_some());
        assert!(set
            .should_block("http://cdn.example.com/images/logo.png", &opts())
            .unwrap()
            .is_none());
    }

    #[test]
    fn exception_rule_overrides_block() {
        let set = ruleset_from(
            "||example.com^\n\
             @@||good.example.com^\n",
        );
        assert!(set
            .should_block("bad.example.com", &opts())
            .unwrap()
            .is_some());
        assert!(set
            .should_block("good.example.com", &opts())
            .unwrap()
            .is_none());
    }

    #[test]
    fn first_matching_rule_index_is_reported() {
        let set = ruleset_from(
            "||first.example^\n\
             ||second.example^\n",
        );
        assert_eq!(set.should_block("second.example", &opts()).unwrap(), Some(1));
    }

    #[test]
    fn options_suffix_is_dropped_from_the_pattern() {
        let set = ruleset_from("||tracker.example.net^$third-party\n");
        assert!(set
            .should_block("tracker.example.net", &opts())
            .unwrap()
            .is_some());
    }

    #[test]
    fn exhausted_budget_reports_deadline_error() {
        let set = ruleset_from("*/banner/*\n");
        let opts = MatchOptions {
            timeout: Duration::ZERO,
            check_freq: 1,
        };
        assert!(matches!(
            set.should_block("http://cdn.example.com/x", &opts),
            Err(MatchError::DeadlineExceeded { .. })
        ));
    }

    #[test]
    fn load_files_skips_sources_without_the_magic_header() {
        let mut good = tempfile::NamedTempFile::new().expect("tmp");
        writeln!(good, "[Adblock Plus 2.0]").expect("write");
        writeln!(good, "||ads.example.com^").expect("write");

        let mut bad = tempfile::NamedTempFile::new().expect("tmp");
        writeln!(bad, "# hosts-style file, not adblock").expect("write");
        writeln!(bad, "||tracker.example.net^").expect("write");

        let set = RuleSet::load_files(&[
            good.path().to_path_buf(),
            bad.path().to_path_buf(),
            PathBuf::from("/nonexistent/rules.txt"),
        ]);

        assert_eq!(set.rule_count(), 1);
        assert!(set
            .should_block("ads.example.com", &opts())
            .unwrap()
            .is_some());
        assert!(set
            .should_block("tracker.example.net", &opts())
            .unwrap()
            .is_none());
    }
}
