use actix_service::{self, Transform};
use actix_web::{
    dev::{Service, ServiceRequest, ServiceResponse},
    Error, HttpMessage,
};
use futures::{
    future::{ready, LocalBoxFuture, Ready},
    FutureExt,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::{fs::read_to_string, rc::Rc, sync::OnceLock};

static DECODING_KEY: OnceLock<Option<DecodingKey>> = OnceLock::new();

#[derive(Debug, Serialize, Deserialize)]
struct ActorClaims {
    aud: String,
    exp: i64,
    iss: String,
    sub: String,
}

#[derive(Debug)]
pub struct ActorData {
    pub email: String,
    pub token: String,
}

pub type Actor = Rc<ActorData>;

pub struct ActorMiddleware<S> {
    service: Rc<S>,
}
pub struct ActorMiddlewareFactory;

/// Decode-only: this server never issues tokens. Without a key file every
/// request is treated as anonymous, which is a supported mode, not an error.
pub fn load_keys() {
    let key = read_to_string("./keys/public_access.pem")
        .ok()
        .and_then(|pem| DecodingKey::from_rsa_pem(pem.as_bytes()).ok());
    if key.is_none() {
        log::warn!("no public access key loaded, writes will be recorded anonymously");
    }
    DECODING_KEY.set(key).ok();
}

pub fn verify(token: &str) -> Option<String> {
    let key = DECODING_KEY.get()?.as_ref()?;
    let validation: Validation = Validation::new(Algorithm::RS256);

    decode::<ActorClaims>(token, key, &validation)
        .ok()
        .map(|data| data.claims.sub)
}

impl<S, B> Service<ServiceRequest> for ActorMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    actix_service::forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let srv: Rc<S> = self.service.clone();

        async move {
            if let Some(header) = req.headers().get("Authorization") {
                if let Ok(header) = header.to_str() {
                    if let Some(token) = header.strip_prefix("Bearer ") {
                        if let Some(email) = verify(token) {
                            let actor: ActorData = ActorData {
                                email,
                                token: token.to_string(),
                            };
                            req.extensions_mut().insert::<Actor>(Rc::new(actor));
                        }
                    }
                }
            }
            let res: ServiceResponse<B> = srv.call(req).await?;
            Ok(res)
        }
        .boxed_local()
    }
}
impl<S, B> Transform<S, ServiceRequest> for ActorMiddlewareFactory
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = ActorMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ActorMiddleware {
            service: Rc::new(service),
        }))
    }
}
