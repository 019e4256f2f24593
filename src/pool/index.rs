//! Criteria-based node selection

use super::{Criteria, Step};
use crate::registry::{Node, NodeRegistry};
use crate::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

/// How closely a selected node matches the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchLevel {
    Sticky,
    Exact,
    /// ASN constraint dropped
    WithoutAsn,
    /// ASN and city dropped; country and protocol still hold
    CountryOnly,
}

impl MatchLevel {
    /// Relaxation order after affinity
    pub const RELAXATION: [MatchLevel; 3] = [
        MatchLevel::Exact,
        MatchLevel::WithoutAsn,
        MatchLevel::CountryOnly,
    ];
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub node: Node,
    pub level: MatchLevel,
}

/// Read-only selection view over the registry
pub struct NodeIndex {
    registry: Arc<NodeRegistry>,
}

impl NodeIndex {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        NodeIndex { registry }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn select(&self, criteria: &Criteria) -> Result<Selection> {
        self.select_with(criteria, &HashSet::new())
    }

    /// Select a node, skipping IDs in `exclude`
    pub fn select_with(&self, criteria: &Criteria, exclude: &HashSet<String>) -> Result<Selection> {
        let snapshot = self.registry.snapshot();
        let eligible: Vec<&Node> = snapshot
            .iter()
            .filter(|n| n.is_active() && !exclude.contains(&n.id))
            .collect();

        if let Step::Found(node) = sticky_step(&eligible, criteria) {
            return Ok(Selection {
                node: node.clone(),
                level: MatchLevel::Sticky,
            });
        }

        for level in MatchLevel::RELAXATION {
            match least_loaded(&eligible, criteria, level) {
                Step::Found(node) => {
                    return Ok(Selection {
                        node: node.clone(),
                        level,
                    })
                }
                Step::Continue(reason) => trace!(?level, reason, "selection relaxed"),
            }
        }

        Err(Error::no_available_node(describe(criteria)))
    }

    /// Active nodes matching `criteria` at `level`, best first
    pub fn ranked(&self, criteria: &Criteria, level: MatchLevel) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|n| n.is_active() && matches(n, criteria, level))
            .collect();
        nodes.sort_by(|a, b| a.cmp_preference(b));
        nodes
    }
}

fn sticky_step<'a>(eligible: &[&'a Node], criteria: &Criteria) -> Step<&'a Node> {
    let Some(wanted) = criteria.sticky_node.as_deref() else {
        return Step::Continue("no affinity");
    };
    let protocol_ok = |n: &Node| criteria.protocol.map_or(true, |p| n.attrs.supports(p));
    match eligible.iter().find(|n| n.id == wanted) {
        Some(node) if protocol_ok(node) => Step::Found(node),
        Some(_) => Step::Continue("sticky node lacks protocol"),
        None => Step::Continue("sticky node not active"),
    }
}

fn least_loaded<'a>(eligible: &[&'a Node], criteria: &Criteria, level: MatchLevel) -> Step<&'a Node> {
    eligible
        .iter()
        .copied()
        .filter(|n| matches(n, criteria, level))
        .min_by(|a, b| a.cmp_preference(b))
        .map_or(Step::Continue("no match"), Step::Found)
}

/// Whether `node` satisfies `criteria` at a relaxation `level`.
///
/// Country and protocol are never relaxed.
pub fn matches(node: &Node, criteria: &Criteria, level: MatchLevel) -> bool {
    if let Some(protocol) = criteria.protocol {
        if !node.attrs.supports(protocol) {
            return false;
        }
    }
    if let Some(country) = &criteria.country {
        if !node.attrs.country.eq_ignore_ascii_case(country) {
            return false;
        }
    }
    let check_city = matches!(level, MatchLevel::Sticky | MatchLevel::Exact | MatchLevel::WithoutAsn);
    if check_city {
        if let Some(city) = &criteria.city {
            if normalize_city(&node.attrs.city) != normalize_city(city) {
                return false;
            }
        }
    }
    let check_asn = matches!(level, MatchLevel::Sticky | MatchLevel::Exact);
    if check_asn {
        if let Some(asn) = criteria.asn {
            if node.attrs.asn != asn {
                return false;
            }
        }
    }
    true
}

/// Canonical city key: accents folded, lower case, only letters and digits.
///
/// `"São Paulo"`, `"sao-paulo"` and `"SAO PAULO"` all map to `"saopaulo"`.
pub fn normalize_city(city: &str) -> String {
    city.chars()
        .map(fold_accent)
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric())
        .collect()
}

fn fold_accent(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => 'a',
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' | 'Ā' | 'Ă' | 'Ą' => 'a',
        'ç' | 'ć' | 'č' | 'Ç' | 'Ć' | 'Č' => 'c',
        'ď' | 'đ' | 'Ď' | 'Đ' => 'd',
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => 'e',
        'È' | 'É' | 'Ê' | 'Ë' | 'Ē' | 'Ė' | 'Ę' | 'Ě' => 'e',
        'ğ' | 'Ğ' => 'g',
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' | 'ı' => 'i',
        'Ì' | 'Í' | 'Î' | 'Ï' | 'Ī' | 'Į' | 'İ' => 'i',
        'ł' | 'ľ' | 'Ł' | 'Ľ' => 'l',
        'ñ' | 'ń' | 'ň' | 'Ñ' | 'Ń' | 'Ň' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => 'o',
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' | 'Ō' | 'Ő' => 'o',
        'ř' | 'Ř' => 'r',
        'ś' | 'š' | 'ş' | 'ș' | 'Ś' | 'Š' | 'Ş' | 'Ș' => 's',
        'ß' => 's',
        'ť' | 'ţ' | 'ț' | 'Ť' | 'Ţ' | 'Ț' => 't',
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' | 'ų' => 'u',
        'Ù' | 'Ú' | 'Û' | 'Ü' | 'Ū' | 'Ů' | 'Ű' | 'Ų' => 'u',
        'ý' | 'ÿ' | 'Ý' | 'Ÿ' => 'y',
        'ź' | 'ż' | 'ž' | 'Ź' | 'Ż' | 'Ž' => 'z',
        other => other,
    }
}

fn describe(criteria: &Criteria) -> String {
    let mut parts = Vec::new();
    if let Some(c) = &criteria.country {
        parts.push(format!("country={}", c));
    }
    if let Some(c) = &criteria.city {
        parts.push(format!("city={}", c));
    }
    if let Some(a) = criteria.asn {
        parts.push(format!("asn={}", a));
    }
    if let Some(p) = criteria.protocol {
        parts.push(format!("protocol={:?}", p));
    }
    if parts.is_empty() {
        "no active nodes".to_string()
    } else {
        format!("no active node for {}", parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{NodeAttributes, NodeStatus, Protocol};
    use std::time::Duration;

    fn setup() -> (Arc<NodeRegistry>, NodeIndex) {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(90)));
        let index = NodeIndex::new(registry.clone());
        (registry, index)
    }

    fn attrs(country: &str, city: &str, asn: u32) -> NodeAttributes {
        NodeAttributes::new(country, city, asn).with_capacity(10)
    }

    #[tokio::test]
    async fn test_empty_registry_is_not_found() {
        let (_, index) = setup();
        let err = index.select(&Criteria::new().country("US")).unwrap_err();
        assert!(matches!(err, Error::NoAvailableNode(_)));
    }

    #[tokio::test]
    async fn test_exact_match() {
        let (registry, index) = setup();
        registry.upsert("a", attrs("US", "Austin", 1), 1);
        registry.upsert("b", attrs("US", "Dallas", 2), 2);

        let sel = index
            .select(&Criteria::new().country("us").city("dallas").asn(2))
            .unwrap();
        assert_eq!(sel.node.id, "b");
        assert_eq!(sel.level, MatchLevel::Exact);
    }

    #[tokio::test]
    async fn test_relaxation_never_crosses_country() {
        let (registry, index) = setup();
        registry.upsert("de", attrs("DE", "Berlin", 3320), 1);
        registry.upsert("us", attrs("US", "Austin", 7018), 2);
        // loads the US node so the idle German one would win on load alone
        let _l1 = registry.acquire_session("us").unwrap();
        let _l2 = registry.acquire_session("us").unwrap();

        let sel = index
            .select(&Criteria::new().country("US").city("Boston").asn(9999))
            .unwrap();
        assert_eq!(sel.node.id, "us");
        assert_eq!(sel.level, MatchLevel::CountryOnly);
    }

    #[tokio::test]
    async fn test_asn_dropped_before_city() {
        let (registry, index) = setup();
        registry.upsert("austin", attrs("US", "Austin", 1), 1);
        registry.upsert("dallas", attrs("US", "Dallas", 2), 2);

        let sel = index
            .select(&Criteria::new().country("US").city("Austin").asn(2))
            .unwrap();
        assert_eq!(sel.node.id, "austin");
        assert_eq!(sel.level, MatchLevel::WithoutAsn);
    }

    #[tokio::test]
    async fn test_no_country_match_fails() {
        let (registry, index) = setup();
        registry.upsert("de", attrs("DE", "Berlin", 3320), 1);
        assert!(index.select(&Criteria::new().country("US")).is_err());
    }

    #[tokio::test]
    async fn test_least_loaded_wins() {
        let (registry, index) = setup();
        registry.upsert("a", attrs("US", "", 0), 1);
        registry.upsert("b", attrs("US", "", 0), 2);
        let _lease = registry.acquire_session("a").unwrap();

        let sel = index.select(&Criteria::new().country("US")).unwrap();
        assert_eq!(sel.node.id, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_heartbeat_breaks_load_tie() {
        let (registry, index) = setup();
        registry.upsert("a", attrs("US", "", 0), 1);
        registry.upsert("b", attrs("US", "", 0), 2);
        tokio::time::advance(Duration::from_secs(5)).await;
        registry.mark_heartbeat("b");

        let sel = index.select(&Criteria::new().country("US")).unwrap();
        assert_eq!(sel.node.id, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_id_breaks_full_tie() {
        let (registry, index) = setup();
        registry.upsert("zeta", attrs("US", "", 0), 1);
        registry.upsert("alpha", attrs("US", "", 0), 2);

        let sel = index.select(&Criteria::new().country("US")).unwrap();
        assert_eq!(sel.node.id, "alpha");
    }

    #[tokio::test]
    async fn test_sticky_beats_load() {
        let (registry, index) = setup();
        registry.upsert("a", attrs("US", "", 0), 1);
        registry.upsert("b", attrs("US", "", 0), 2);
        let _lease = registry.acquire_session("a").unwrap();

        for _ in 0..3 {
            let sel = index
                .select(&Criteria::new().country("US").sticky("a"))
                .unwrap();
            assert_eq!(sel.node.id, "a");
            assert_eq!(sel.level, MatchLevel::Sticky);
        }

        registry.remove("a");
        let sel = index
            .select(&Criteria::new().country("US").sticky("a"))
            .unwrap();
        assert_eq!(sel.node.id, "b");
    }

    #[tokio::test]
    async fn test_draining_node_not_selectable() {
        let (registry, index) = setup();
        registry.upsert("a", attrs("US", "", 0), 1);
        registry.set_status("a", NodeStatus::Draining);
        assert!(index.select(&Criteria::new().country("US")).is_err());
        assert!(index
            .select(&Criteria::new().country("US").sticky("a"))
            .is_err());
    }

    #[tokio::test]
    async fn test_protocol_filter_and_exclude() {
        let (registry, index) = setup();
        registry.upsert(
            "http-only",
            attrs("US", "", 0).with_protocols(vec![Protocol::Http]),
            1,
        );
        registry.upsert("both", attrs("US", "", 0), 2);

        let sel = index
            .select(&Criteria::new().country("US").protocol(Protocol::Socks5))
            .unwrap();
        assert_eq!(sel.node.id, "both");

        let mut exclude = HashSet::new();
        exclude.insert("both".to_string());
        let sel = index
            .select_with(&Criteria::new().country("US"), &exclude)
            .unwrap();
        assert_eq!(sel.node.id, "http-only");
    }

    #[test]
    fn test_normalize_city() {
        assert_eq!(normalize_city("São Paulo"), "saopaulo");
        assert_eq!(normalize_city("sao-paulo"), "saopaulo");
        assert_eq!(normalize_city("ZÜRICH"), "zurich");
        assert_eq!(normalize_city("New York"), "newyork");
    }
}
