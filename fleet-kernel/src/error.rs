/**
 * ERREURS KERNEL - Taxonomie des échecs du plan de contrôle
 *
 * RÔLE :
 * Regroupe les erreurs de chaque sous-système (routes, store, transport)
 * sous une seule enum exposée aux créateurs de sessions et à l'API REST.
 *
 * POLITIQUE :
 * - Démarrage de session : toute erreur est fatale pour la session
 * - Travail périodique (heartbeat, push, catalogue) : loggé puis ignoré
 * - Teardown : loggé, jamais remonté
 * - Validation de route : remontée immédiatement à l'appelant
 */

use crate::routes::RouteError;
use crate::session::SessionState;
use crate::store::StoreError;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
    #[error("protocol decode error: {0}")]
    ProtocolDecode(#[from] serde_json::Error),
    #[error("route validation error: {0}")]
    RouteValidation(#[from] RouteError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("session cannot start from state {0:?}")]
    InvalidState(SessionState),
}

pub type KernelResult<T> = Result<T, KernelError>;
