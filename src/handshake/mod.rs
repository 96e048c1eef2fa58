//! Handshake layer: records, pluggable authentication, and the client
//! state machine.
//!
//! The handshake is TLS-like in shape (hellos, key schedule phases,
//! verify signatures over a transcript) but authentication is pluggable:
//! a pre-trusted key, a hardware-keystore attestation chain, an
//! app-attestation-service statement, or a generic X.509 chain, selected
//! per direction by negotiated index.

pub mod attest;
pub mod auth;
pub mod engine;
pub mod records;

pub use attest::{
    AppAttestationProvider, AppAttestationVerifier, AttestationPolicy,
    KeystoreAttestationProvider, KeystoreAttestationVerifier, KeystoreCertifier,
    StatementService, StaticStatementService, X509ChainProvider, X509ChainVerifier,
};
pub use auth::{
    signing_context, AuthAlgorithm, AuthError, AuthProvider, AuthVerifier, PreTrustedKeyProvider,
    PreTrustedKeyVerifier,
};
pub use engine::{HandshakeEngine, HandshakeEngineConfig, KeyPoll};
pub use records::{
    AuthenticationRequest, AuthenticationShare, AuthenticationVerify, ClientHello, KeyUpdate,
    RawRecord, RecordAssembler, RecordError, RecordType, ServerHello,
};
