//! Configuration parsing.
//!
//! The config file is line oriented. A `cache` or `nosql` line opens a
//! section and carries the global options of that engine; `rule` lines
//! attach to the preceding section:
//!
//! ```text
//! cache on data-size 16m dict-size 1m dir /var/lib/larder uri /_larder
//! rule static key method.scheme.host.uri ttl 1h code 200,301 disk async
//! rule api key method.host.path.param_v ttl 30 etag on if internal
//! nosql on data-size 4m
//! rule kv ttl 0
//! ```
//!
//! A `dir` directive without a path (at the end of its line) enables
//! persistence under the stock state directory.
//!
//! Configuration errors are fatal; the engine refuses to start on them.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, format_err, Error};

use crate::engine::{EngineConfig, Mode};
use crate::rule::{
    parse_extend, parse_key_format, parse_size, parse_ttl, Acl, AclFn, DiskMode, Rule,
};

/// Maps an `if`/`unless` name from the config file to a host-provided
/// predicate.
pub type AclResolver<'a> = dyn Fn(&str) -> Option<Box<AclFn>> + 'a;

pub struct Section {
    pub on: bool,
    pub conf: EngineConfig,
    pub rules: Vec<Rule>,
}

#[derive(Default)]
pub struct LarderConfig {
    pub cache: Option<Section>,
    pub nosql: Option<Section>,
}

fn parse_count(option: &str, value: &str, line: usize) -> Result<usize, Error> {
    let count: usize = value
        .parse()
        .map_err(|_| format_err!("line {}: {} expects a number, got '{}'", line, option, value))?;

    // zero falls back to the default, as a disabled quota would stall the
    // housekeeping entirely
    Ok(if count == 0 { 100 } else { count })
}

fn parse_section(mode: Mode, args: &[&str], line: usize) -> Result<Section, Error> {
    let name = match mode {
        Mode::Cache => "cache",
        Mode::Nosql => "nosql",
    };

    let mut conf = EngineConfig::new(mode, name);

    let on = match args.first() {
        Some(&"on") => true,
        Some(&"off") => false,
        _ => bail!("line {}: '{}' expects 'on' or 'off' as argument", line, name),
    };

    let mut iter = args[1..].iter();

    while let Some(&option) = iter.next() {
        if option == "dir" {
            // a bare `dir` at the end of the line falls back to the stock
            // state directory
            conf.dir = Some(match iter.next() {
                Some(&path) => PathBuf::from(path),
                None => PathBuf::from(crate::buildcfg::LARDER_STATE_DIR),
            });
            continue;
        }

        let mut value = || {
            iter.next()
                .copied()
                .ok_or_else(|| format_err!("line {}: {} expects a value", line, option))
        };

        match option {
            "data-size" => conf.data_size = parse_size(value()?)?,
            "dict-size" => conf.dict_size = parse_size(value()?)?,
            "uri" => {
                if mode != Mode::Cache {
                    bail!("line {}: 'uri' is only valid for cache", line);
                }
                conf.uri = Some(value()?.to_string());
            }
            "purge-method" => conf.purge_method = value()?.to_string(),
            "dict-cleaner" => conf.dict_cleaner = parse_count(option, value()?, line)?,
            "data-cleaner" => conf.data_cleaner = parse_count(option, value()?, line)?,
            "disk-cleaner" => conf.disk_cleaner = parse_count(option, value()?, line)?,
            "disk-loader" => conf.disk_loader = parse_count(option, value()?, line)?,
            "disk-saver" => conf.disk_saver = parse_count(option, value()?, line)?,
            _ => bail!("line {}: unrecognized option '{}'", line, option),
        }
    }

    Ok(Section {
        on,
        conf,
        rules: Vec::new(),
    })
}

fn parse_rule(
    args: &[&str],
    line: usize,
    id: u32,
    uuid: u32,
    resolver: &AclResolver,
) -> Result<Rule, Error> {

    let name = match args.first() {
        Some(name) => *name,
        None => bail!("line {}: 'rule' expects a name", line),
    };

    let mut rule = Rule::new(id, uuid, name);
    let mut iter = args[1..].iter();

    let mut seen: Vec<&str> = Vec::new();
    let mut check_dup = |option: &'static str| -> Result<(), Error> {
        if seen.contains(&option) {
            bail!("line {}: rule {}: {} already specified", line, name, option);
        }
        seen.push(option);
        Ok(())
    };

    while let Some(&option) = iter.next() {
        let mut value = || {
            iter.next()
                .copied()
                .ok_or_else(|| format_err!("line {}: rule {}: {} expects a value", line, name, option))
        };

        match option {
            "key" => {
                check_dup("key")?;
                rule.key = parse_key_format(value()?)?;
            }
            "ttl" => {
                check_dup("ttl")?;
                rule.ttl = parse_ttl(value()?)?;
            }
            "code" => {
                check_dup("code")?;
                let value = value()?;
                if value != "all" {
                    for code in value.split(',') {
                        let code: u16 = code.parse().map_err(|_| {
                            format_err!("line {}: rule {}: invalid code '{}'", line, name, code)
                        })?;
                        rule.codes.push(code);
                    }
                }
            }
            "disk" => {
                check_dup("disk")?;
                rule.disk = DiskMode::parse(value()?)?;
            }
            "etag" => {
                check_dup("etag")?;
                rule.etag = match value()? {
                    "on" => true,
                    "off" => false,
                    other => bail!("line {}: rule {}: etag expects [on|off], got '{}'", line, name, other),
                };
            }
            "last-modified" => {
                check_dup("last-modified")?;
                rule.last_modified = match value()? {
                    "on" => true,
                    "off" => false,
                    other => bail!(
                        "line {}: rule {}: last-modified expects [on|off], got '{}'",
                        line, name, other
                    ),
                };
            }
            "extend" => {
                check_dup("extend")?;
                rule.extend = parse_extend(value()?)?;
            }
            "if" | "unless" => {
                check_dup("if")?;
                let acl_name = value()?;
                let cond = resolver(acl_name).ok_or_else(|| {
                    format_err!("line {}: rule {}: unknown acl '{}'", line, name, acl_name)
                })?;

                rule.acl = if option == "if" {
                    Acl::If(cond)
                } else {
                    Acl::Unless(cond)
                };
            }
            _ => bail!("line {}: rule {}: unrecognized option '{}'", line, name, option),
        }
    }

    Ok(rule)
}

/// Parse the full configuration text.
pub fn parse(text: &str, resolver: &AclResolver) -> Result<LarderConfig, Error> {

    let mut config = LarderConfig::default();
    let mut current: Option<Mode> = None;

    // equally-named rules share an id
    let mut ids: HashMap<String, u32> = HashMap::new();
    let mut next_id = 1u32;
    let mut next_uuid = 1u32;

    for (idx, raw_line) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw_line.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let tokens: Vec<&str> = trimmed.split_whitespace().collect();

        match tokens[0] {
            "cache" => {
                if config.cache.is_some() {
                    bail!("line {}: 'cache' already specified", line);
                }
                config.cache = Some(parse_section(Mode::Cache, &tokens[1..], line)?);
                current = Some(Mode::Cache);
            }
            "nosql" => {
                if config.nosql.is_some() {
                    bail!("line {}: 'nosql' already specified", line);
                }
                config.nosql = Some(parse_section(Mode::Nosql, &tokens[1..], line)?);
                current = Some(Mode::Nosql);
            }
            "rule" => {
                let section = match current {
                    Some(Mode::Cache) => config.cache.as_mut().unwrap(),
                    Some(Mode::Nosql) => config.nosql.as_mut().unwrap(),
                    None => bail!("line {}: 'rule' before any 'cache' or 'nosql' section", line),
                };

                let name = tokens
                    .get(1)
                    .ok_or_else(|| format_err!("line {}: 'rule' expects a name", line))?;

                let id = *ids.entry(name.to_string()).or_insert_with(|| {
                    let id = next_id;
                    next_id += 1;
                    id
                });

                let rule = parse_rule(&tokens[1..], line, id, next_uuid, resolver)?;
                next_uuid += 1;

                if rule.disk != DiskMode::Off && section.conf.dir.is_none() {
                    bail!(
                        "line {}: rule {}: disk enabled but no `dir` defined",
                        line, rule.name
                    );
                }

                section.rules.push(rule);
            }
            other => bail!("line {}: unrecognized directive '{}'", line, other),
        }
    }

    Ok(config)
}

/// Load and parse a configuration file.
pub fn load(path: &std::path::Path, resolver: &AclResolver) -> Result<LarderConfig, Error> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| format_err!("unable to read {:?} - {}", path, err))?;

    parse(&text, resolver)
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::rule::KeyComponent;

    fn no_acls(_: &str) -> Option<Box<AclFn>> {
        None
    }

    #[test]
    fn minimal_cache_section() {
        let config = parse("cache on data-size 2m\nrule r1 ttl 10\n", &no_acls).unwrap();

        let cache = config.cache.unwrap();
        assert!(cache.on);
        assert_eq!(cache.conf.data_size, 2 << 20);
        assert_eq!(cache.conf.dict_cleaner, 100);
        assert_eq!(cache.rules.len(), 1);
        assert_eq!(cache.rules[0].ttl, 10);
        assert_eq!(cache.rules[0].key, crate::rule::default_key());
        assert!(config.nosql.is_none());
    }

    #[test]
    fn full_rule_options() {
        let text = "cache on dir /tmp/larder\n\
            rule assets key method.host.path ttl 1h code 200,301 disk async \
            etag on last-modified on extend 20,30,40\n";
        let config = parse(text, &no_acls).unwrap();

        let rule = &config.cache.unwrap().rules[0];
        assert_eq!(rule.key[2], KeyComponent::Path);
        assert_eq!(rule.ttl, 3600);
        assert_eq!(rule.codes, vec![200, 301]);
        assert_eq!(rule.disk, DiskMode::Async);
        assert!(rule.etag);
        assert!(rule.last_modified);
        assert!(rule.extend.is_some());
    }

    #[test]
    fn rule_ids_shared_by_name() {
        let text = "cache on\nrule a ttl 1\nrule b ttl 2\nrule a ttl 3\n";
        let config = parse(text, &no_acls).unwrap();
        let rules = &config.cache.unwrap().rules;

        assert_eq!(rules[0].id, rules[2].id);
        assert_ne!(rules[0].id, rules[1].id);

        let uuids: Vec<u32> = rules.iter().map(|rule| rule.uuid).collect();
        assert_eq!(uuids, vec![1, 2, 3]);
    }

    #[test]
    fn disk_without_dir_is_fatal() {
        let text = "cache on\nrule r1 disk sync\n";
        assert!(parse(text, &no_acls).is_err());
    }

    #[test]
    fn bare_dir_uses_state_dir() {
        let config = parse("cache on dir\nrule r1 ttl 1 disk sync\n", &no_acls).unwrap();
        let cache = config.cache.unwrap();

        assert_eq!(
            cache.conf.dir.as_deref(),
            Some(std::path::Path::new(crate::buildcfg::LARDER_STATE_DIR))
        );
    }

    #[test]
    fn unknown_acl_is_fatal() {
        let text = "cache on\nrule r1 if internal\n";
        assert!(parse(text, &no_acls).is_err());
    }

    #[test]
    fn acl_resolution() {
        let resolver = |name: &str| -> Option<Box<AclFn>> {
            if name == "never" {
                Some(Box::new(|_, _| false))
            } else {
                None
            }
        };

        let text = "cache on\nrule r1 unless never\n";
        let config = parse(text, &resolver).unwrap();
        assert!(matches!(config.cache.unwrap().rules[0].acl, Acl::Unless(_)));
    }

    #[test]
    fn rule_outside_section_is_fatal() {
        assert!(parse("rule r1 ttl 1\n", &no_acls).is_err());
    }

    #[test]
    fn duplicate_option_is_fatal() {
        let text = "cache on\nrule r1 ttl 1 ttl 2\n";
        assert!(parse(text, &no_acls).is_err());
    }

    #[test]
    fn uri_only_for_cache() {
        assert!(parse("nosql on uri /stats\n", &no_acls).is_err());
        assert!(parse("cache on uri /stats\n", &no_acls).is_ok());
    }

    #[test]
    fn comments_and_blank_lines() {
        let text = "# larder config\n\ncache on\n# a rule\nrule r1 ttl 5\n";
        let config = parse(text, &no_acls).unwrap();
        assert_eq!(config.cache.unwrap().rules.len(), 1);
    }

    #[test]
    fn both_sections() {
        let text = "cache on data-size 2m\nrule c ttl 1\nnosql on\nrule n ttl 0 key method.host.uri.body\n";
        let config = parse(text, &no_acls).unwrap();

        assert_eq!(config.cache.unwrap().rules.len(), 1);
        let nosql = config.nosql.unwrap();
        assert_eq!(nosql.rules.len(), 1);
        assert_eq!(nosql.rules[0].key.len(), 4);
    }
}
