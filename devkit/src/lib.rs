/*!
# Fleet DevKit - Doublures et utilitaires de test pour le kernel

Bibliothèque facilitant les tests des sessions agents avec:
- Transport en mémoire scriptable (émissions enregistrées, événements simulés)
- Store instrumenté avec injection de pannes
- Fixtures agents, tâches et catalogues
- Harness qui assemble le tout
*/

pub mod fixtures;
pub mod harness;
pub mod mock_transport;
pub mod recording_store;

pub use harness::SessionHarness;
pub use mock_transport::MockTransport;
pub use recording_store::RecordingStore;
