#![doc = include_str!("../README.md")]

pub mod channel;
pub mod consumer;
pub mod letter;
pub mod middleware;

#[doc(inline)]
pub use channel::{
    Channel, ChannelSetup, ChannelSource, DeliveryProperties, RawDelivery, Subscription,
};

#[doc(inline)]
pub use consumer::{
    Consumer, ConsumerConfig, ConsumerError, ConsumerErrorKind, Handler, SubscribeError,
    SubscribeErrorKind,
};

#[doc(inline)]
pub use letter::{DecodeError, Letter, ReplyError, ReplyErrorKind};

#[doc(inline)]
pub use middleware::{Flow, Middleware};
