pub mod verifier;

pub use verifier::ProofVerifier;
