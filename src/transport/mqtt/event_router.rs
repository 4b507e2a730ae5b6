//! Pure translation of rumqttc events into session decisions

use crate::protocol::Frame;
use crate::transport::connection::BrokerError;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{
    ConnectReturnCode, Packet, PubAckReason, Publish, PublishProperties, SubscribeReasonCode,
};
use rumqttc::v5::{ConnectionError, Event, StateError};
use rumqttc::Outgoing;

/// Routing decisions for MQTT events
#[derive(Debug)]
pub enum EventRoute {
    /// Session confirmed by the broker
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived(Frame),
    /// A queued publish was written with this packet id
    PublishSent(u16),
    PublishAcknowledged {
        pkid: u16,
        result: Result<(), BrokerError>,
    },
    /// A queued subscribe was written with this packet id
    SubscribeSent(u16),
    SubscriptionConfirmed {
        pkid: u16,
        result: Result<(), String>,
    },
    /// Broker closed the session
    Disconnected(String),
    /// Keep-alives and other protocol chatter
    InfrastructureEvent(String),
    OutgoingEvent,
}

/// Route an MQTT event to the session handler
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => match incoming {
            Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
            Packet::Publish(publish) => EventRoute::MessageReceived(frame_from_publish(publish)),
            // rumqttc turns non-success reasons into `StateError::PubAckFail`
            // and ends the session, see `rejected_publish`
            Packet::PubAck(puback) => EventRoute::PublishAcknowledged {
                pkid: puback.pkid,
                result: classify_puback(&puback.reason),
            },
            Packet::SubAck(suback) => {
                let failures: Vec<String> = suback
                    .return_codes
                    .iter()
                    .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
                    .map(|code| format!("{code:?}"))
                    .collect();
                EventRoute::SubscriptionConfirmed {
                    pkid: suback.pkid,
                    result: if failures.is_empty() {
                        Ok(())
                    } else {
                        Err(failures.join(", "))
                    },
                }
            }
            Packet::Disconnect(disconnect) => {
                EventRoute::Disconnected(format!("broker disconnect: {:?}", disconnect.reason_code))
            }
            other => EventRoute::InfrastructureEvent(format!("{other:?}")),
        },
        Event::Outgoing(Outgoing::Publish(pkid)) => EventRoute::PublishSent(*pkid),
        Event::Outgoing(Outgoing::Subscribe(pkid)) => EventRoute::SubscribeSent(*pkid),
        Event::Outgoing(_) => EventRoute::OutgoingEvent,
    }
}

/// Convert an inbound publish into a frame
pub fn frame_from_publish(publish: &Publish) -> Frame {
    let properties = publish.properties.as_ref();
    Frame {
        topic: String::from_utf8_lossy(&publish.topic).to_string(),
        body: publish.payload.clone(),
        content_type: properties.and_then(|p| p.content_type.clone()),
        correlation_id: properties
            .and_then(|p| p.correlation_data.as_ref())
            .map(|data| String::from_utf8_lossy(data).to_string()),
        headers: properties
            .map(|p| p.user_properties.clone())
            .unwrap_or_default(),
    }
}

/// MQTT v5 properties carrying a frame's metadata
pub fn publish_properties(frame: &Frame) -> PublishProperties {
    PublishProperties {
        content_type: frame.content_type.clone(),
        correlation_data: frame
            .correlation_id
            .as_ref()
            .map(|id| Bytes::from(id.clone().into_bytes())),
        user_properties: frame.headers.clone(),
        ..Default::default()
    }
}

/// `NotAuthorized` is the broker's stale-token signal
pub fn classify_puback(reason: &PubAckReason) -> Result<(), BrokerError> {
    match reason {
        PubAckReason::Success | PubAckReason::NoMatchingSubscribers => Ok(()),
        PubAckReason::NotAuthorized => Err(BrokerError::TokenRejected),
        other => Err(BrokerError::PublishFailed(format!("broker nack: {other:?}"))),
    }
}

/// Separate credential rejections from every other connection failure
pub fn classify_connection_error(error: &ConnectionError) -> BrokerError {
    match error {
        ConnectionError::ConnectionRefused(code) if is_auth_refusal(code) => {
            BrokerError::AuthRejected(format!("{code:?}"))
        }
        ConnectionError::MqttState(StateError::ConnFail { reason }) if is_auth_refusal(reason) => {
            BrokerError::AuthRejected(format!("{reason:?}"))
        }
        other => BrokerError::ConnectionFailed(other.to_string()),
    }
}

/// A publish rejection that rumqttc surfaced as a session error
pub fn rejected_publish(error: &ConnectionError) -> Option<BrokerError> {
    match error {
        ConnectionError::MqttState(StateError::PubAckFail { reason }) => {
            classify_puback(reason).err()
        }
        _ => None,
    }
}

fn is_auth_refusal(code: &ConnectReturnCode) -> bool {
    matches!(
        code,
        ConnectReturnCode::NotAuthorized
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::BadAuthenticationMethod
            | ConnectReturnCode::Banned
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::{ConnAck, PubAck};
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_route_connack() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            route_mqtt_event(&event),
            EventRoute::ConnectionAcknowledged
        ));
    }

    #[test]
    fn test_route_publish_preserves_properties() {
        let mut publish = Publish::new("fog/commands/send", QoS::AtLeastOnce, "{}", None);
        publish.properties = Some(PublishProperties {
            content_type: Some("application/json".to_string()),
            correlation_data: Some(Bytes::from_static(b"corr-1")),
            user_properties: vec![("token".to_string(), "abc".to_string())],
            ..Default::default()
        });

        let EventRoute::MessageReceived(frame) = route_mqtt_event(&Event::Incoming(Packet::Publish(publish)))
        else {
            panic!("expected a message");
        };
        assert_eq!(frame.topic, "fog/commands/send");
        assert_eq!(frame.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(frame.token(), Some("abc"));
        assert_eq!(&frame.body[..], b"{}");
    }

    #[test]
    fn test_route_outgoing_publish() {
        assert!(matches!(
            route_mqtt_event(&Event::Outgoing(Outgoing::Publish(7))),
            EventRoute::PublishSent(7)
        ));
        assert!(matches!(
            route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        ));
    }

    #[test]
    fn test_route_puback_reasons() {
        let puback = |reason| {
            Event::Incoming(Packet::PubAck(PubAck {
                pkid: 3,
                reason,
                properties: None,
            }))
        };

        assert!(matches!(
            route_mqtt_event(&puback(PubAckReason::Success)),
            EventRoute::PublishAcknowledged { pkid: 3, result: Ok(()) }
        ));
        assert!(matches!(
            route_mqtt_event(&puback(PubAckReason::NotAuthorized)),
            EventRoute::PublishAcknowledged {
                result: Err(BrokerError::TokenRejected),
                ..
            }
        ));
        assert!(matches!(
            route_mqtt_event(&puback(PubAckReason::QuotaExceeded)),
            EventRoute::PublishAcknowledged {
                result: Err(BrokerError::PublishFailed(_)),
                ..
            }
        ));
    }

    #[test]
    fn test_classify_connection_refusals() {
        let auth = ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword);
        assert!(classify_connection_error(&auth).is_auth());

        let busy = ConnectionError::ConnectionRefused(ConnectReturnCode::ServerBusy);
        assert!(matches!(
            classify_connection_error(&busy),
            BrokerError::ConnectionFailed(_)
        ));
    }

    #[test]
    fn test_properties_round_trip_frame_metadata() {
        let frame = Frame {
            topic: "t".to_string(),
            body: Bytes::new(),
            content_type: Some("application/json".to_string()),
            correlation_id: Some("c".to_string()),
            headers: vec![("message-id".to_string(), "m".to_string())],
        };
        let properties = publish_properties(&frame);
        assert_eq!(properties.content_type.as_deref(), Some("application/json"));
        assert_eq!(properties.correlation_data, Some(Bytes::from_static(b"c")));
        assert_eq!(properties.user_properties.len(), 1);
    }
}
