//! Fixtures: participant metadata and namespaces for an EVM dapp/wallet pair

use crate::core_session::{Metadata, Namespace, Namespaces, ProposalNamespace, ProposalNamespaces, Redirect};

pub const TEST_ACCOUNT: &str = "eip155:1:0xab16a96d359ec26a11e2c2b3d8f8b8942d5bfcdb";

pub fn dapp_metadata() -> Metadata {
    Metadata {
        name: "Example Dapp".into(),
        description: "A dapp used in tests".into(),
        url: "https://dapp.example".into(),
        icons: vec!["https://dapp.example/icon.png".into()],
        redirect: None,
    }
}

pub fn wallet_metadata() -> Metadata {
    Metadata {
        name: "Example Wallet".into(),
        description: "A wallet used in tests".into(),
        url: "https://wallet.example".into(),
        icons: vec![],
        redirect: Some(Redirect {
            native: Some("examplewallet://".into()),
            universal: Some("https://wallet.example/wc".into()),
            link_mode: false,
        }),
    }
}

/// `eip155` with mainnet, `eth_sendTransaction`/`personal_sign`, `chainChanged`/`accountsChanged`
pub fn required_namespaces() -> ProposalNamespaces {
    let mut namespaces = ProposalNamespaces::new();
    namespaces.insert(
        "eip155".into(),
        ProposalNamespace {
            chains: Some(vec!["eip155:1".into()]),
            methods: vec!["eth_sendTransaction".into(), "personal_sign".into()],
            events: vec!["chainChanged".into(), "accountsChanged".into()],
        },
    );
    namespaces
}

/// Namespaces that satisfy [`required_namespaces`] with one extra chain
pub fn approved_namespaces() -> Namespaces {
    let mut namespaces = Namespaces::new();
    namespaces.insert(
        "eip155".into(),
        Namespace {
            chains: Some(vec!["eip155:1".into(), "eip155:137".into()]),
            accounts: vec![
                TEST_ACCOUNT.into(),
                "eip155:137:0xab16a96d359ec26a11e2c2b3d8f8b8942d5bfcdb".into(),
            ],
            methods: vec!["eth_sendTransaction".into(), "personal_sign".into()],
            events: vec!["chainChanged".into(), "accountsChanged".into()],
        },
    );
    namespaces
}
