use serde_json::{Value, json};

fn conversation_path(summary: &str, extra: Value) -> Value {
    let mut operation = json!({
        "summary": summary,
        "parameters": [{ "$ref": "#/components/parameters/ConversationPath" }],
        "responses": {
            "400": { "$ref": "#/components/responses/Error" },
            "500": { "$ref": "#/components/responses/Error" },
        },
    });
    let Value::Object(extra) = extra else {
        return operation;
    };
    for (key, value) in extra {
        if key == "responses" {
            if let (Some(Value::Object(responses)), Value::Object(more)) =
                (operation.get_mut("responses"), value)
            {
                responses.extend(more);
            }
        } else {
            operation[key.as_str()] = value;
        }
    }
    operation
}

fn json_response(description: &str, schema: &str) -> Value {
    json!({
        "description": description,
        "content": {
            "application/json": {
                "schema": { "$ref": format!("#/components/schemas/{schema}") },
            },
        },
    })
}

fn events_body() -> Value {
    json!({
        "required": true,
        "content": {
            "application/json": {
                "schema": {
                    "type": "array",
                    "items": { "$ref": "#/components/schemas/Event" },
                },
            },
        },
    })
}

pub fn openapi_spec() -> Value {
    json!({
        "openapi": "3.1.0",
        "info": {
            "title": "Dialogue Tracker API",
            "version": env!("CARGO_PKG_VERSION"),
            "description": "Event-sourced conversation trackers with next-action prediction.",
        },
        "paths": {
            "/": {
                "get": {
                    "summary": "Greeting with the server version",
                    "responses": {
                        "200": {
                            "description": "Plain-text greeting",
                            "content": { "text/plain": { "schema": { "type": "string" } } },
                        },
                    },
                },
            },
            "/version": {
                "get": {
                    "summary": "Server version",
                    "responses": { "200": json_response("Version", "Version") },
                },
            },
            "/healthz": {
                "get": {
                    "summary": "Health check",
                    "responses": { "200": json_response("Service health", "Health") },
                },
            },
            "/openapi.json": {
                "get": {
                    "summary": "This document",
                    "responses": { "200": { "description": "OpenAPI 3.1 document" } },
                },
            },
            "/conversations/{conversation_id}/parse": {
                "get": conversation_path("Handle a user message passed as `q` or `query`", json!({
                    "parameters": [
                        { "$ref": "#/components/parameters/ConversationPath" },
                        { "name": "q", "in": "query", "schema": { "type": "string" } },
                        { "name": "query", "in": "query", "schema": { "type": "string" } },
                    ],
                    "responses": {
                        "200": json_response("Next action and tracker state", "Prediction"),
                        "404": { "$ref": "#/components/responses/Error" },
                    },
                })),
                "post": conversation_path("Handle a user message passed as `q` or `query`", json!({
                    "requestBody": {
                        "required": true,
                        "content": {
                            "application/json": {
                                "schema": { "$ref": "#/components/schemas/ParseRequest" },
                            },
                        },
                    },
                    "responses": {
                        "200": json_response("Next action and tracker state", "Prediction"),
                        "404": { "$ref": "#/components/responses/Error" },
                    },
                })),
            },
            "/conversations/{conversation_id}/continue": {
                "post": conversation_path("Log an executed action and its events, predict the next action", json!({
                    "requestBody": {
                        "required": true,
                        "content": {
                            "application/json": {
                                "schema": { "$ref": "#/components/schemas/ContinueRequest" },
                            },
                        },
                    },
                    "responses": {
                        "200": json_response("Next action and tracker state", "Prediction"),
                    },
                })),
            },
            "/conversations/{conversation_id}/tracker/events": {
                "post": conversation_path("Append events to a conversation", json!({
                    "requestBody": events_body(),
                    "responses": {
                        "200": json_response("Tracker state without events", "Tracker"),
                    },
                })),
            },
            "/conversations/{conversation_id}/tracker": {
                "get": conversation_path("Tracker state including events", json!({
                    "responses": {
                        "200": json_response("Tracker state with events", "Tracker"),
                    },
                })),
                "put": conversation_path("Replace the whole conversation history", json!({
                    "requestBody": events_body(),
                    "responses": {
                        "200": json_response("Tracker state with events", "Tracker"),
                    },
                })),
                "delete": conversation_path("Delete a conversation", json!({
                    "responses": {
                        "204": { "description": "Conversation deleted" },
                        "404": { "$ref": "#/components/responses/Error" },
                    },
                })),
            },
        },
        "components": {
            "parameters": {
                "ConversationPath": {
                    "name": "conversation_id",
                    "in": "path",
                    "required": true,
                    "schema": { "type": "string", "minLength": 1 },
                },
            },
            "responses": {
                "Error": json_response("Error", "Error"),
            },
            "schemas": {
                "Error": {
                    "type": "object",
                    "required": ["error"],
                    "properties": { "error": { "type": "string" } },
                },
                "Version": {
                    "type": "object",
                    "required": ["version"],
                    "properties": { "version": { "type": "string" } },
                },
                "Health": {
                    "type": "object",
                    "required": ["status", "service"],
                    "properties": {
                        "status": { "type": "string" },
                        "service": { "type": "string" },
                        "store": { "type": "string" },
                    },
                },
                "Event": {
                    "type": "object",
                    "required": ["event"],
                    "properties": {
                        "event": {
                            "type": "string",
                            "enum": [
                                "user", "user_uttered", "bot", "bot_uttered", "set_slot", "slot",
                                "action_executed", "action", "restart", "restarted",
                                "reset_slots", "pause", "resume",
                            ],
                        },
                        "timestamp": { "type": "number" },
                    },
                    "additionalProperties": true,
                },
                "ParseRequest": {
                    "type": "object",
                    "properties": {
                        "q": { "type": "string" },
                        "query": { "type": "string" },
                    },
                },
                "ContinueRequest": {
                    "type": "object",
                    "properties": {
                        "executed_action": { "type": ["string", "null"] },
                        "events": {
                            "type": "array",
                            "items": { "$ref": "#/components/schemas/Event" },
                        },
                    },
                },
                "Tracker": {
                    "type": "object",
                    "required": ["sender_id", "slots", "turn_count"],
                    "properties": {
                        "sender_id": { "type": "string" },
                        "slots": { "type": "object", "additionalProperties": true },
                        "latest_message": { "type": ["object", "null"] },
                        "latest_action_name": { "type": ["string", "null"] },
                        "latest_bot_utterance": { "type": ["string", "null"] },
                        "turn_count": { "type": "integer", "minimum": 0 },
                        "paused": { "type": "boolean" },
                        "latest_event_time": { "type": ["number", "null"] },
                        "events": {
                            "type": "array",
                            "items": { "$ref": "#/components/schemas/Event" },
                        },
                    },
                },
                "Prediction": {
                    "type": "object",
                    "required": ["next_action", "tracker"],
                    "properties": {
                        "next_action": { "type": "string" },
                        "tracker": { "$ref": "#/components/schemas/Tracker" },
                    },
                },
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::openapi_spec;

    #[test]
    fn openapi_spec_declares_31_and_conversation_routes() {
        let spec = openapi_spec();
        assert_eq!(spec["openapi"], "3.1.0");
        assert!(spec["paths"]["/openapi.json"].is_object());
        let tracker = &spec["paths"]["/conversations/{conversation_id}/tracker"];
        for method in ["get", "put", "delete"] {
            assert!(tracker[method].is_object(), "missing {method}");
        }
        assert!(spec["paths"]["/conversations/{conversation_id}/parse"]["get"]["responses"]["404"].is_object());
        assert!(spec["paths"]["/conversations/{conversation_id}/continue"]["post"]["responses"]["400"].is_object());
        assert!(spec["components"]["schemas"]["Prediction"].is_object());
    }
}
