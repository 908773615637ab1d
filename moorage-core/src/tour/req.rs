use bytes::Bytes;
use http::{HeaderMap, Method, Uri, Version};

use super::{ContentMeter, TourId, TourKey};
use crate::{
    post::{Post, Posts},
    rudder::RudderId,
};

/// Who receives the request content of a tour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consumer {
    /// No docker has claimed the content yet; it is held on the tour.
    #[default]
    Pending,
    /// Content is counted as consumed on arrival.
    Discard,
    /// Content is forwarded to the backend ship on this rudder.
    Ship(RudderId),
}

#[derive(Debug)]
pub struct TourReq {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub content_length: u64,
    pub meter: ContentMeter,
    consumer: Consumer,
    pending: Vec<Bytes>,
    ended: bool,
}

impl Default for TourReq {
    fn default() -> Self {
        Self {
            method: Method::GET,
            uri: Uri::default(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            content_length: 0,
            meter: ContentMeter::default(),
            consumer: Consumer::Pending,
            pending: Vec::new(),
            ended: false,
        }
    }
}

impl TourReq {
    pub(crate) fn reset(&mut self, limit: u64) {
        self.method = Method::GET;
        self.uri = Uri::default();
        self.version = Version::HTTP_11;
        self.headers.clear();
        self.content_length = 0;
        self.meter.reset(limit);
        self.consumer = Consumer::Pending;
        self.pending.clear();
        self.ended = false;
    }

    #[inline]
    pub fn consumer(&self) -> Consumer {
        self.consumer
    }

    /// True once every request content byte has been posted.
    #[inline]
    pub fn ended(&self) -> bool {
        self.ended
    }

    pub(crate) fn mark_ended(&mut self) {
        self.ended = true;
    }

    pub(crate) fn post(
        &mut self,
        data: Bytes,
        key: TourKey,
        check: TourId,
        posts: &mut Posts,
    ) -> bool {
        let len = data.len();
        self.meter.post(len);
        match self.consumer {
            Consumer::Pending => self.pending.push(data),
            Consumer::Discard => {
                self.meter.consume(len);
            }
            Consumer::Ship(_) => posts.push_back(Post::ReqContent {
                tour: key,
                check,
                data,
            }),
        }
        self.meter.available()
    }

    /// Installs the consumer and replays what arrived before it. Returns true when
    /// discarding the held content freed the meter.
    pub(crate) fn set_consumer(
        &mut self,
        consumer: Consumer,
        key: TourKey,
        check: TourId,
        posts: &mut Posts,
    ) -> bool {
        self.consumer = consumer;
        let pending = std::mem::take(&mut self.pending);
        match consumer {
            Consumer::Pending => {
                self.pending = pending;
                false
            }
            Consumer::Discard => {
                let len: usize = pending.iter().map(Bytes::len).sum();
                len > 0 && self.meter.consume(len)
            }
            Consumer::Ship(_) => {
                for data in pending {
                    posts.push_back(Post::ReqContent {
                        tour: key,
                        check,
                        data,
                    });
                }
                if self.ended {
                    posts.push_back(Post::ReqEnd { tour: key, check });
                }
                false
            }
        }
    }
}
