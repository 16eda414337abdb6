//! Namespace validation and conformance
//!
//! Keys are either a family (`eip155`, chains listed inside) or a full chain
//! id (`eip155:1`, chain implied by the key). Conformance is checked per
//! family after normalizing both forms.
//!
//! Check order for an approval: namespace keys, then chains, then methods,
//! then events. The first failing check decides the error.

use super::caip::{self, AccountId, ChainId};
use super::types::{Namespace, Namespaces, ProposalNamespace, ProposalNamespaces};
use crate::errors::{EngineError, EngineResult};
use std::collections::{BTreeMap, BTreeSet};

/// Chains, methods and events merged per family
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Scope {
    chains: BTreeSet<String>,
    methods: BTreeSet<String>,
    events: BTreeSet<String>,
}

fn proposal_chains(key: &str, ns: &ProposalNamespace) -> Vec<String> {
    if caip::is_chain_id(key) {
        vec![key.to_string()]
    } else {
        ns.chains.clone().unwrap_or_default()
    }
}

/// Every chain a session namespace grants: explicit chains, account chains, and the key itself
pub fn approved_chains(key: &str, ns: &Namespace) -> BTreeSet<String> {
    let mut chains: BTreeSet<String> = ns.chains.iter().flatten().cloned().collect();
    chains.extend(
        ns.accounts
            .iter()
            .filter_map(|a| AccountId::parse(a).ok())
            .map(|a| a.chain_id.to_string()),
    );
    if caip::is_chain_id(key) {
        chains.insert(key.to_string());
    }
    chains
}

fn required_scopes(required: &ProposalNamespaces) -> BTreeMap<String, Scope> {
    let mut scopes: BTreeMap<String, Scope> = BTreeMap::new();
    for (key, ns) in required {
        let scope = scopes.entry(caip::family(key).to_string()).or_default();
        scope.chains.extend(proposal_chains(key, ns));
        scope.methods.extend(ns.methods.iter().cloned());
        scope.events.extend(ns.events.iter().cloned());
    }
    scopes
}

fn approved_scopes(approved: &Namespaces) -> BTreeMap<String, Scope> {
    let mut scopes: BTreeMap<String, Scope> = BTreeMap::new();
    for (key, ns) in approved {
        let scope = scopes.entry(caip::family(key).to_string()).or_default();
        scope.chains.extend(approved_chains(key, ns));
        scope.methods.extend(ns.methods.iter().cloned());
        scope.events.extend(ns.events.iter().cloned());
    }
    scopes
}

fn missing(required: &BTreeSet<String>, approved: &BTreeSet<String>) -> Option<String> {
    let gaps: Vec<&str> = required.difference(approved).map(String::as_str).collect();
    (!gaps.is_empty()).then(|| gaps.join(", "))
}

fn validate_key(key: &str) -> EngineResult<()> {
    if caip::is_valid_namespace(key) || caip::is_chain_id(key) {
        Ok(())
    } else {
        Err(EngineError::UnsupportedNamespaceKey(key.to_string()))
    }
}

/// Shape check for required or optional namespaces in a proposal
pub fn validate_proposal_namespaces(namespaces: &ProposalNamespaces) -> EngineResult<()> {
    for (key, ns) in namespaces {
        validate_key(key)?;

        if caip::is_chain_id(key) {
            if let Some(chains) = &ns.chains {
                if chains.iter().any(|c| c != key) {
                    return Err(EngineError::UnsupportedChains(format!(
                        "{}: chain-scoped key cannot list other chains",
                        key
                    )));
                }
            }
            continue;
        }

        let chains = ns.chains.as_deref().unwrap_or_default();
        if chains.is_empty() {
            return Err(EngineError::UnsupportedChains(format!("{}: no chains requested", key)));
        }
        for chain in chains {
            let parsed = ChainId::parse(chain)
                .map_err(|_| EngineError::UnsupportedChains(format!("{}: invalid chain {}", key, chain)))?;
            if parsed.namespace != *key {
                return Err(EngineError::UnsupportedChains(format!(
                    "{}: chain {} belongs to another namespace",
                    key, chain
                )));
            }
        }
    }
    Ok(())
}

/// Shape check for approved session namespaces
pub fn validate_namespaces(namespaces: &Namespaces) -> EngineResult<()> {
    if namespaces.is_empty() {
        return Err(EngineError::MissingOrInvalid("namespaces are empty".to_string()));
    }

    for (key, ns) in namespaces {
        validate_key(key)?;
        let family = caip::family(key);

        let declared: Option<BTreeSet<&str>> = match &ns.chains {
            Some(chains) => {
                for chain in chains {
                    let parsed = ChainId::parse(chain).map_err(|_| {
                        EngineError::UnsupportedChains(format!("{}: invalid chain {}", key, chain))
                    })?;
                    if parsed.namespace != family {
                        return Err(EngineError::UnsupportedChains(format!(
                            "{}: chain {} belongs to another namespace",
                            key, chain
                        )));
                    }
                }
                Some(chains.iter().map(String::as_str).collect())
            }
            None => None,
        };

        for account in &ns.accounts {
            let parsed = AccountId::parse(account)?;
            let chain = parsed.chain_id.to_string();
            if parsed.chain_id.namespace != family {
                return Err(EngineError::UnsupportedAccounts(format!(
                    "{}: account {} belongs to another namespace",
                    key, account
                )));
            }
            if caip::is_chain_id(key) && chain != *key {
                return Err(EngineError::UnsupportedAccounts(format!(
                    "{}: account {} is on another chain",
                    key, account
                )));
            }
            if let Some(declared) = &declared {
                if !declared.contains(chain.as_str()) {
                    return Err(EngineError::UnsupportedAccounts(format!(
                        "{}: account {} is on undeclared chain {}",
                        key, account, chain
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Approved namespaces must cover every required family as a non-strict superset
pub fn check_conforming(required: &ProposalNamespaces, approved: &Namespaces) -> EngineResult<()> {
    let required = required_scopes(required);
    let approved = approved_scopes(approved);

    for family in required.keys() {
        if !approved.contains_key(family) {
            return Err(EngineError::UnsupportedNamespaceKey(format!(
                "required namespace {} not approved",
                family
            )));
        }
    }

    for (family, req) in &required {
        let granted = &approved[family];
        if let Some(gaps) = missing(&req.chains, &granted.chains) {
            return Err(EngineError::UnsupportedChains(format!("{}: {}", family, gaps)));
        }
    }
    for (family, req) in &required {
        if let Some(gaps) = missing(&req.methods, &approved[family].methods) {
            return Err(EngineError::UnsupportedMethods(format!("{}: {}", family, gaps)));
        }
    }
    for (family, req) in &required {
        if let Some(gaps) = missing(&req.events, &approved[family].events) {
            return Err(EngineError::UnsupportedEvents(format!("{}: {}", family, gaps)));
        }
    }
    Ok(())
}

/// Namespaces granting `chain_id`
fn namespaces_for_chain<'a>(namespaces: &'a Namespaces, chain_id: &str) -> Vec<&'a Namespace> {
    namespaces
        .iter()
        .filter(|(key, ns)| approved_chains(key, ns).contains(chain_id))
        .map(|(_, ns)| ns)
        .collect()
}

pub fn check_chain(namespaces: &Namespaces, chain_id: &str) -> EngineResult<()> {
    ChainId::parse(chain_id)?;
    if namespaces_for_chain(namespaces, chain_id).is_empty() {
        return Err(EngineError::UnsupportedChains(format!(
            "chain {} is not approved",
            chain_id
        )));
    }
    Ok(())
}

pub fn check_method(namespaces: &Namespaces, chain_id: &str, method: &str) -> EngineResult<()> {
    check_chain(namespaces, chain_id)?;
    let allowed = namespaces_for_chain(namespaces, chain_id)
        .iter()
        .any(|ns| ns.methods.iter().any(|m| m == method));
    if !allowed {
        return Err(EngineError::UnsupportedMethods(format!(
            "{} is not approved on {}",
            method, chain_id
        )));
    }
    Ok(())
}

pub fn check_event(namespaces: &Namespaces, chain_id: &str, event: &str) -> EngineResult<()> {
    check_chain(namespaces, chain_id)?;
    let allowed = namespaces_for_chain(namespaces, chain_id)
        .iter()
        .any(|ns| ns.events.iter().any(|e| e == event));
    if !allowed {
        return Err(EngineError::UnsupportedEvents(format!(
            "{} is not approved on {}",
            event, chain_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCOUNT: &str = "eip155:1:0xab16a96D359eC26a11e2C2b3d8f8B8942d5Bfcdb";

    fn required() -> ProposalNamespaces {
        let mut ns = ProposalNamespaces::new();
        ns.insert(
            "eip155".into(),
            ProposalNamespace {
                chains: Some(vec!["eip155:1".into()]),
                methods: vec!["eth_sign".into()],
                events: vec!["chainChanged".into()],
            },
        );
        ns
    }

    fn approved(chains: &[&str], methods: &[&str], events: &[&str]) -> Namespaces {
        let mut ns = Namespaces::new();
        ns.insert(
            "eip155".into(),
            Namespace {
                chains: Some(chains.iter().map(|s| s.to_string()).collect()),
                accounts: vec![ACCOUNT.into()],
                methods: methods.iter().map(|s| s.to_string()).collect(),
                events: events.iter().map(|s| s.to_string()).collect(),
            },
        );
        ns
    }

    #[test]
    fn test_superset_conforms() {
        let ns = approved(
            &["eip155:1", "eip155:137"],
            &["eth_sign", "personal_sign"],
            &["chainChanged", "accountsChanged"],
        );
        validate_namespaces(&ns).unwrap();
        check_conforming(&required(), &ns).unwrap();
    }

    #[test]
    fn test_exact_match_conforms() {
        let ns = approved(&["eip155:1"], &["eth_sign"], &["chainChanged"]);
        check_conforming(&required(), &ns).unwrap();
    }

    #[test]
    fn test_missing_pieces_map_to_typed_errors() {
        let mut ns = approved(&["eip155:1"], &["eth_sign"], &["chainChanged"]);
        ns.get_mut("eip155").unwrap().chains = Some(vec!["eip155:137".into()]);
        ns.get_mut("eip155").unwrap().accounts.clear();
        assert!(matches!(
            check_conforming(&required(), &ns),
            Err(EngineError::UnsupportedChains(_))
        ));

        let ns = approved(&["eip155:1"], &["personal_sign"], &["chainChanged"]);
        assert!(matches!(
            check_conforming(&required(), &ns),
            Err(EngineError::UnsupportedMethods(_))
        ));

        let ns = approved(&["eip155:1"], &["eth_sign"], &[]);
        assert!(matches!(
            check_conforming(&required(), &ns),
            Err(EngineError::UnsupportedEvents(_))
        ));

        let mut other = Namespaces::new();
        other.insert(
            "solana".into(),
            Namespace {
                chains: Some(vec!["solana:mainnet".into()]),
                ..Default::default()
            },
        );
        assert!(matches!(
            check_conforming(&required(), &other),
            Err(EngineError::UnsupportedNamespaceKey(_))
        ));
    }

    #[test]
    fn test_chain_scoped_required_key() {
        let mut req = ProposalNamespaces::new();
        req.insert(
            "eip155:1".into(),
            ProposalNamespace {
                chains: None,
                methods: vec!["eth_sign".into()],
                events: vec![],
            },
        );
        validate_proposal_namespaces(&req).unwrap();
        check_conforming(&req, &approved(&["eip155:1"], &["eth_sign"], &[])).unwrap();
    }

    #[test]
    fn test_account_must_be_on_declared_chain() {
        let mut ns = approved(&["eip155:137"], &[], &[]);
        assert!(matches!(
            validate_namespaces(&ns),
            Err(EngineError::UnsupportedAccounts(_))
        ));

        ns.get_mut("eip155").unwrap().chains = None;
        validate_namespaces(&ns).unwrap();
    }

    #[test]
    fn test_proposal_shape() {
        assert!(validate_proposal_namespaces(&required()).is_ok());

        let mut bad = required();
        bad.get_mut("eip155").unwrap().chains = Some(vec!["cosmos:cosmoshub-4".into()]);
        assert!(validate_proposal_namespaces(&bad).is_err());

        let mut empty = required();
        empty.get_mut("eip155").unwrap().chains = None;
        assert!(validate_proposal_namespaces(&empty).is_err());

        let mut bad_key = ProposalNamespaces::new();
        bad_key.insert("E!".into(), ProposalNamespace::default());
        assert!(matches!(
            validate_proposal_namespaces(&bad_key),
            Err(EngineError::UnsupportedNamespaceKey(_))
        ));
    }

    #[test]
    fn test_method_and_event_checks() {
        let ns = approved(&["eip155:1"], &["eth_sign"], &["chainChanged"]);
        check_method(&ns, "eip155:1", "eth_sign").unwrap();
        assert!(matches!(
            check_method(&ns, "eip155:1", "eth_sendTransaction"),
            Err(EngineError::UnsupportedMethods(_))
        ));
        assert!(matches!(
            check_method(&ns, "eip155:5", "eth_sign"),
            Err(EngineError::UnsupportedChains(_))
        ));
        check_event(&ns, "eip155:1", "chainChanged").unwrap();
        assert!(check_event(&ns, "eip155:1", "accountsChanged").is_err());
        assert!(validate_namespaces(&Namespaces::new()).is_err());
    }
}
