// Copyright 2020 Joyent, Inc.

//! Typed method registration and dispatch.
//!
//! A service object lists its methods explicitly through
//! [`RpcService::register_methods`]. Each method has the shape
//! `fn(&Service, Request) -> Reply` and is exposed on the wire under the
//! command `"Service.Method"`. The request is decoded with the codec named
//! by the message's protocol tag, and the reply is encoded with the same
//! codec.

use std::any::type_name;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use slog::{debug, info, warn, Logger};

use crate::codec::{Codec, CodecRegistry};
use crate::connection::panic_message;
use crate::error::{DispatchError, RegisterError};
use crate::protocol::RpcMessage;
use crate::server::Server;

/// Separator between service and method in a command.
pub const METHOD_SEPARATOR: char = '.';

type Invoker = dyn Fn(Option<Value>) -> Result<Value, String> + Send + Sync;

/// An object whose methods are callable over RPC.
pub trait RpcService: Sized + Send + Sync + 'static {
    /// Name the methods are exposed under. Defaults to the type's own name
    /// without its module path.
    fn service_name() -> String {
        short_type_name::<Self>().to_string()
    }

    fn register_methods(methods: &mut MethodSet<Self>);
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// One admitted method.
pub struct MethodDescriptor {
    pub service_name: String,
    pub method_name: String,
    pub request_type: &'static str,
    pub reply_type: &'static str,
    invoker: Arc<Invoker>,
}

impl MethodDescriptor {
    pub fn command(&self) -> String {
        format!("{}{}{}", self.service_name, METHOD_SEPARATOR, self.method_name)
    }

    /// Calls the method with a decoded request; `None` means an empty body
    /// and yields the request type's default value.
    pub fn invoke(
        &self,
        request: Option<Value>,
    ) -> Result<Value, DispatchError> {
        let invoker = Arc::clone(&self.invoker);
        match panic::catch_unwind(AssertUnwindSafe(|| invoker(request))) {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(DispatchError::Codec(e)),
            Err(panic) => Err(DispatchError::Panicked(
                self.command(),
                panic_message(panic.as_ref()),
            )),
        }
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("service_name", &self.service_name)
            .field("method_name", &self.method_name)
            .field("request_type", &self.request_type)
            .field("reply_type", &self.reply_type)
            .finish()
    }
}

/// The methods collected from one service object during registration.
pub struct MethodSet<Svc> {
    service_name: String,
    service: Arc<Svc>,
    methods: BTreeMap<String, Arc<MethodDescriptor>>,
    log: Logger,
}

impl<Svc: RpcService> MethodSet<Svc> {
    /// Admits `method` under `name`. Names that are empty or contain the
    /// method separator are not admitted.
    pub fn add_method<Req, Reply, F>(&mut self, name: &str, method: F)
    where
        Req: DeserializeOwned + Default + 'static,
        Reply: Serialize + 'static,
        F: Fn(&Svc, Req) -> Reply + Send + Sync + 'static,
    {
        if name.is_empty() || name.contains(METHOD_SEPARATOR) {
            warn!(self.log, "method not admitted";
                "service" => &self.service_name, "method" => name);
            return;
        }

        let service = Arc::clone(&self.service);
        let invoker = move |request: Option<Value>| -> Result<Value, String> {
            let request: Req = match request {
                Some(value) => {
                    serde_json::from_value(value).map_err(|e| e.to_string())?
                }
                None => Req::default(),
            };
            let reply = method(&service, request);
            serde_json::to_value(&reply).map_err(|e| e.to_string())
        };

        let descriptor = MethodDescriptor {
            service_name: self.service_name.clone(),
            method_name: name.to_string(),
            request_type: type_name::<Req>(),
            reply_type: type_name::<Reply>(),
            invoker: Arc::new(invoker),
        };
        self.methods.insert(name.to_string(), Arc::new(descriptor));
    }
}

/// Every registered service's methods, plus the codecs used to call them.
#[derive(Clone)]
pub struct MethodRegistry {
    services: BTreeMap<String, BTreeMap<String, Arc<MethodDescriptor>>>,
    codecs: Arc<CodecRegistry>,
    log: Logger,
}

impl MethodRegistry {
    pub fn new(log: Option<&Logger>) -> MethodRegistry {
        MethodRegistry {
            services: BTreeMap::new(),
            codecs: Arc::new(CodecRegistry::new()),
            log: crate::default_logger(log),
        }
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub fn set_codec<P, C>(&self, protoc: P, codec: C)
    where
        P: Into<String>,
        C: Codec + 'static,
    {
        self.codecs.set_codec(protoc, codec);
    }

    /// Collects the methods of `service`. Nothing is added when the service
    /// has no usable name or no admitted method.
    pub fn register<Svc: RpcService>(
        &mut self,
        service: Svc,
    ) -> Result<(), RegisterError> {
        let service_name = Svc::service_name();
        if service_name.is_empty() || service_name.contains(METHOD_SEPARATOR) {
            return Err(RegisterError::NoServiceName(
                type_name::<Svc>().to_string(),
            ));
        }

        let mut set = MethodSet {
            service_name: service_name.clone(),
            service: Arc::new(service),
            methods: BTreeMap::new(),
            log: self.log.clone(),
        };
        Svc::register_methods(&mut set);

        if set.methods.is_empty() {
            return Err(RegisterError::NoSuitableMethods(service_name));
        }

        info!(self.log, "service registered";
            "service" => &service_name, "methods" => set.methods.len());
        self.services.insert(service_name, set.methods);
        Ok(())
    }

    /// Every `"Service.Method"` command currently registered.
    pub fn commands(&self) -> Vec<String> {
        self.services
            .values()
            .flat_map(|methods| methods.values().map(|m| m.command()))
            .collect()
    }

    pub fn lookup(&self, command: &str) -> Option<&Arc<MethodDescriptor>> {
        let mut parts = command.splitn(2, METHOD_SEPARATOR);
        let service = parts.next()?;
        let method = parts.next()?;
        self.services.get(service)?.get(method)
    }

    /// Runs the method named by `msg.command` and returns the reply message:
    /// the same command and protocol tag with the encoded reply as body.
    /// Failures are reported as the body text.
    pub fn dispatch(&self, msg: RpcMessage) -> RpcMessage {
        match self.try_dispatch(&msg) {
            Ok(Some(body)) => msg.with_body(body),
            Ok(None) => msg,
            Err(e) => {
                debug!(self.log, "method call failed";
                    "command" => &msg.command, "err" => %e);
                msg.with_body(e.to_string())
            }
        }
    }

    fn try_dispatch(
        &self,
        msg: &RpcMessage,
    ) -> Result<Option<Vec<u8>>, DispatchError> {
        let descriptor = self
            .lookup(&msg.command)
            .ok_or_else(|| DispatchError::UnknownMethod(msg.command.clone()))?;
        let codec = self
            .codecs
            .get(&msg.protoc)
            .ok_or_else(|| DispatchError::UnknownProtocol(msg.protoc.clone()))?;

        let request = if msg.body.is_empty() {
            None
        } else {
            let value = codec
                .decode(&msg.body)
                .map_err(|e| DispatchError::Codec(e.to_string()))?;
            Some(value)
        };

        let reply = descriptor.invoke(request)?;
        if reply.is_null() {
            return Ok(None);
        }
        codec
            .encode(&reply)
            .map(Some)
            .map_err(|e| DispatchError::Codec(e.to_string()))
    }

    /// Installs one server command per registered method. Each call's reply
    /// is queued back on the connection it arrived on.
    pub fn install(&self, server: &Server) {
        let methods = Arc::new(self.clone());
        for command in self.commands() {
            let methods = Arc::clone(&methods);
            server.set_command(command, move |conn, msg| {
                let reply = methods.dispatch(msg);
                async move {
                    if let Err(e) = conn.send(reply).await {
                        warn!(conn.logger(), "failed to queue reply";
                            "err" => %e);
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use serde_derive::{Deserialize, Serialize};

    #[derive(Default, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct ArithReq {
        a: i64,
        b: i64,
    }

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct ArithReply {
        pro: i64,
        quo: i64,
        rem: i64,
    }

    struct Arith;

    impl RpcService for Arith {
        fn register_methods(methods: &mut MethodSet<Self>) {
            methods.add_method("Multiply", |_: &Arith, req: ArithReq| {
                ArithReply {
                    pro: req.a * req.b,
                    ..ArithReply::default()
                }
            });
            methods.add_method("Divide", |_: &Arith, req: ArithReq| {
                if req.b == 0 {
                    panic!("divide by zero");
                }
                ArithReply {
                    quo: req.a / req.b,
                    rem: req.a % req.b,
                    ..ArithReply::default()
                }
            });
            methods.add_method("Noop", |_: &Arith, _: ArithReq| ());
            methods.add_method("Bad.Name", |_: &Arith, _: ArithReq| 0);
        }
    }

    struct Hollow;

    impl RpcService for Hollow {
        fn register_methods(methods: &mut MethodSet<Self>) {
            methods.add_method("", |_: &Hollow, _: ()| ());
        }
    }

    struct Nameless;

    impl RpcService for Nameless {
        fn service_name() -> String {
            String::new()
        }

        fn register_methods(methods: &mut MethodSet<Self>) {
            methods.add_method("Ping", |_: &Nameless, _: ()| "pong");
        }
    }

    fn registry() -> MethodRegistry {
        let mut registry = MethodRegistry::new(None);
        registry.register(Arith).unwrap();
        registry
    }

    fn reply_of(body: &[u8]) -> ArithReply {
        serde_json::from_slice(body).unwrap()
    }

    #[test]
    fn admits_only_well_named_methods() {
        let registry = registry();
        assert_eq!(
            registry.commands(),
            vec!["Arith.Divide", "Arith.Multiply", "Arith.Noop"]
        );

        let multiply = registry.lookup("Arith.Multiply").unwrap();
        assert_eq!(multiply.service_name, "Arith");
        assert_eq!(multiply.method_name, "Multiply");
        assert!(multiply.request_type.ends_with("ArithReq"));
        assert!(multiply.reply_type.ends_with("ArithReply"));
        assert!(registry.lookup("Arith.Bad.Name").is_none());
        assert!(registry.lookup("Arith").is_none());
    }

    #[test]
    fn rejects_services_without_methods_or_name() {
        let mut registry = MethodRegistry::new(None);
        assert_eq!(
            registry.register(Hollow),
            Err(RegisterError::NoSuitableMethods("Hollow".to_string()))
        );
        assert!(matches!(
            registry.register(Nameless),
            Err(RegisterError::NoServiceName(_))
        ));
        assert!(registry.commands().is_empty());
    }

    #[test]
    fn dispatch_multiply() {
        let msg = RpcMessage::json("Arith.Multiply", r#"{"A":6,"B":7}"#);
        let reply = registry().dispatch(msg);

        assert_eq!(reply.command, "Arith.Multiply");
        assert_eq!(reply.protoc, "json");
        assert_eq!(reply_of(&reply.body).pro, 42);
    }

    #[test]
    fn empty_body_is_the_zero_request() {
        let reply = registry().dispatch(RpcMessage::json("Arith.Multiply", ""));
        assert_eq!(reply_of(&reply.body), ArithReply::default());
    }

    #[test]
    fn null_reply_leaves_the_body_alone() {
        let msg = RpcMessage::json("Arith.Noop", r#"{"A":1,"B":2}"#);
        let reply = registry().dispatch(msg.clone());
        assert_eq!(reply, msg);
    }

    #[test]
    fn errors_become_the_reply_body() {
        let registry = registry();

        let bad_json = registry.dispatch(RpcMessage::json("Arith.Multiply", "{"));
        assert!(serde_json::from_slice::<Value>(&bad_json.body).is_err());
        assert!(!bad_json.body.is_empty());

        let msg = RpcMessage::new("Arith.Multiply", "xml", "<A>1</A>");
        let unknown = registry.dispatch(msg);
        assert_eq!(unknown.body, "error: unknown protocol xml");
        assert_eq!(unknown.protoc, "xml");

        let wrong_shape =
            registry.dispatch(RpcMessage::json("Arith.Multiply", r#""six""#));
        assert!(String::from_utf8_lossy(&wrong_shape.body).contains("struct"));
    }

    #[test]
    fn method_panic_becomes_the_reply_body() {
        let msg = RpcMessage::json("Arith.Divide", r#"{"A":99,"B":0}"#);
        let reply = registry().dispatch(msg);
        let text = String::from_utf8_lossy(&reply.body).into_owned();
        assert!(text.contains("Arith.Divide panicked"), "{}", text);
        assert!(text.contains("divide by zero"), "{}", text);

        let msg = RpcMessage::json("Arith.Divide", r#"{"A":99,"B":63}"#);
        let reply = registry().dispatch(msg);
        let expected = ArithReply {
            quo: 1,
            rem: 36,
            ..ArithReply::default()
        };
        assert_eq!(reply_of(&reply.body), expected);
    }

    #[test]
    fn registered_codec_is_used_for_both_directions() {
        struct Loud;
        impl Codec for Loud {
            fn decode(
                &self,
                body: &[u8],
            ) -> Result<Value, crate::codec::CodecError> {
                Ok(serde_json::from_slice(body)?)
            }
            fn encode(
                &self,
                value: &Value,
            ) -> Result<Vec<u8>, crate::codec::CodecError> {
                Ok(value.to_string().to_uppercase().into_bytes())
            }
        }

        let registry = registry();
        registry.set_codec("loud", Loud);
        let msg = RpcMessage::new("Arith.Multiply", "loud", r#"{"A":2,"B":3}"#);
        let reply = registry.dispatch(msg);
        assert_eq!(reply.body, r#"{"PRO":6,"QUO":0,"REM":0}"#);
    }
}
