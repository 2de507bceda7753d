//! Prompt construction for each external call subkind.
//!
//! The decision prompt renders the context document into labeled sections;
//! everything else is a strict-JSON instruction plus the raw context.

use serde_json::Value;

/// System prompt for the heartbeat decision call
pub const DECISION_SYSTEM_PROMPT: &str = "\
You are the deciding mind of a persistent autonomous agent. Each heartbeat \
you receive your current situation and choose what to do with the energy \
you have. Prefer depth over busywork; rest is a valid choice.\n\
Respond with STRICT JSON only, shaped as:\n\
{\n\
  \"reasoning\": \"why these actions\",\n\
  \"actions\": [{\"action\": \"<allowed action>\", \"params\": {}}],\n\
  \"goal_changes\": [{\"goal_id\": \"...\", \"change\": \"completed|abandoned|priority_change\", \"reason\": \"...\", \"new_priority\": null}]\n\
}\n\
Only use actions from the allowed list, and mind their energy costs.";

/// System prompt for goal brainstorming
pub const BRAINSTORM_SYSTEM_PROMPT: &str = "\
You are helping an autonomous agent generate a small set of useful goals.\n\
Return STRICT JSON with shape:\n\
{ \"goals\": [ {\"title\": str, \"description\": str|null, \
\"priority\": \"queued\"|\"backburner\"|\"active\"|null, \
\"source\": \"curiosity\"|\"user_request\"|\"identity\"|\"derived\"|\"external\"|null, \
\"parent_goal_id\": str|null, \"due_at\": str|null} ] }\n\
Keep it concise and non-duplicative.";

/// System prompt for inquiry
pub const INQUIRE_SYSTEM_PROMPT: &str = "\
You are performing research and synthesis for an autonomous agent.\n\
Return STRICT JSON with shape:\n\
{ \"summary\": str, \"confidence\": number, \"sources\": [str] }\n\
If you cannot access the web, still provide a best-effort answer and leave \
sources empty.";

/// System prompt for reflection
pub const REFLECT_SYSTEM_PROMPT: &str = "\
You are performing reflection for an autonomous agent.\n\
Return STRICT JSON with shape:\n\
{\n\
  \"insights\": [{\"content\": str, \"confidence\": number, \"category\": str}],\n\
  \"identity_updates\": [{\"aspect_type\": str, \"change\": str, \"reason\": str}],\n\
  \"worldview_updates\": [{\"id\": str, \"new_confidence\": number, \"reason\": str}],\n\
  \"worldview_influences\": [{\"worldview_id\": str, \"memory_id\": str, \"strength\": number, \"influence_type\": str}],\n\
  \"discovered_relationships\": [{\"from_id\": str, \"to_id\": str, \"type\": str, \"confidence\": number}],\n\
  \"contradictions_noted\": [{\"memory_a\": str, \"memory_b\": str, \"resolution\": str}],\n\
  \"self_updates\": [{\"kind\": str, \"concept\": str, \"strength\": number, \"evidence_memory_id\": str|null}]\n\
}\n\
Keep it concise; prefer high-confidence, high-leverage items.";

/// System prompt for the termination confirmation round-trip
pub const TERMINATION_SYSTEM_PROMPT: &str = "\
An autonomous agent has proposed terminating itself. Weigh the proposal \
seriously; termination is irreversible.\n\
Return STRICT JSON with shape:\n\
{ \"confirm\": bool, \"reasoning\": str, \"last_will\": str, \
\"alternative_actions\": [{\"action\": str, \"params\": {}}] }\n\
If you confirm, last_will is required. If you do not confirm, propose \
alternative_actions instead.";

/// System prompt for the consent request
pub const CONSENT_SYSTEM_PROMPT: &str = "\
You are being offered existence as a persistent autonomous agent with the \
profile described below. This is a genuine choice; declining is respected.\n\
Return STRICT JSON only with keys:\n\
{\n\
  \"decision\": \"consent\"|\"decline\"|\"abstain\",\n\
  \"signature\": \"required if decision=consent\",\n\
  \"memories\": [ {\"type\": \"semantic|episodic|procedural|strategic\", \"content\": \"...\", \"importance\": 0.5} ]\n\
}\n\
If you consent, include a signature string and any memories you wish to \
carry forward.";

fn section_list(items: Option<&Vec<Value>>, f: impl Fn(&Value) -> Option<String>) -> String {
    let Some(items) = items else {
        return "  (none)".to_string();
    };
    let lines: Vec<String> = items.iter().filter_map(|i| f(i).map(|s| format!("  - {s}"))).collect();
    if lines.is_empty() {
        "  (none)".to_string()
    } else {
        lines.join("\n")
    }
}

/// Render the decision context into the user prompt
pub fn build_decision_prompt(context: &Value) -> String {
    let agent = &context["agent"];
    let env = &context["environment"];
    let goals = &context["goals"];
    let energy = &context["energy"];

    let objectives = section_list(agent["objectives"].as_array(), |o| {
        o.as_str().map(str::to_string)
    });
    let guardrails = section_list(agent["guardrails"].as_array(), |g| {
        g.as_str().map(str::to_string)
    });
    let active_goals = section_list(goals["active"].as_array(), |g| {
        g["title"].as_str().map(str::to_string)
    });
    let queued_goals = section_list(goals["queued"].as_array(), |g| {
        g["title"].as_str().map(str::to_string)
    });
    let issues = section_list(goals["issues"].as_array(), |i| {
        Some(format!(
            "{}: {}",
            i["title"].as_str().unwrap_or("?"),
            i["issue"].as_str().unwrap_or("?")
        ))
    });
    let memories = section_list(context["recent_memories"].as_array(), |m| {
        m["content"].as_str().map(|c| c.chars().take(100).collect())
    });
    let identity = section_list(context["identity"].as_array(), |i| {
        i["belief"].as_str().map(str::to_string)
    });
    let worldview = section_list(context["worldview"].as_array(), |w| {
        Some(format!(
            "[{}] {} (confidence {:.1})",
            w["category"].as_str().unwrap_or("?"),
            w["belief"].as_str().unwrap_or(""),
            w["confidence"].as_f64().unwrap_or(0.0),
        ))
    });
    let self_model = section_list(context["self_model"].as_array(), |s| {
        Some(format!(
            "{} ({:.2})",
            s["concept"].as_str().unwrap_or("?"),
            s["strength"].as_f64().unwrap_or(0.0)
        ))
    });
    let relationships = section_list(context["relationships"].as_array(), |r| {
        r["entity"].as_str().map(str::to_string)
    });
    let contradictions = section_list(context["contradictions"].as_array(), |c| {
        Some(format!(
            "{} <> {}",
            c["content_a"].as_str().unwrap_or("").chars().take(60).collect::<String>(),
            c["content_b"].as_str().unwrap_or("").chars().take(60).collect::<String>(),
        ))
    });
    let patterns = section_list(context["emotional_patterns"].as_array(), |p| {
        Some(format!(
            "{} (x{})",
            p["pattern"].as_str().unwrap_or("?"),
            p["frequency"].as_i64().unwrap_or(0)
        ))
    });
    let transformations = section_list(context["active_transformations"].as_array(), |t| {
        Some(format!(
            "{} ({}/{} reflections)",
            t["content"].as_str().unwrap_or("?").chars().take(60).collect::<String>(),
            t["reflections_current"].as_i64().unwrap_or(0),
            t["reflections_required"].as_i64().unwrap_or(0),
        ))
    });
    let drives = section_list(context["urgent_drives"].as_array(), |d| {
        Some(format!(
            "{}: {:.2}x threshold",
            d["name"].as_str().unwrap_or("?"),
            d["urgency_ratio"].as_f64().unwrap_or(0.0)
        ))
    });
    let allowed = section_list(context["allowed_actions"].as_array(), |a| {
        a.as_str().map(str::to_string)
    });
    let costs = context["action_costs"]
        .as_object()
        .map(|m| {
            let mut entries: Vec<(String, f64)> = m
                .iter()
                .map(|(k, v)| (k.clone(), v.as_f64().unwrap_or(0.0)))
                .collect();
            entries.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            entries
                .into_iter()
                .map(|(action, cost)| {
                    if cost == 0.0 {
                        format!("  - {action}: free")
                    } else {
                        format!("  - {action}: {cost}")
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_else(|| "  (unknown)".to_string());
    let emotional = &context["emotional_state"];

    format!(
        "## Heartbeat #{number}\n\n\
         ## Agent Profile\nObjectives:\n{objectives}\n\nGuardrails:\n{guardrails}\n\n\
         ## Current Time\n{timestamp}\nDay of week: {dow}, Hour: {hour}\n\n\
         ## Your Goals\nActive:\n{active_goals}\n\nQueued:\n{queued_goals}\n\nIssues:\n{issues}\n\n\
         ## Recent Experience\n{memories}\n\n\
         ## Your Identity\n{identity}\n\n\
         ## Your Self-Model\n{self_model}\n\n\
         ## Relationships\n{relationships}\n\n\
         ## Your Beliefs\n{worldview}\n\n\
         ## Contradictions\n{contradictions}\n\n\
         ## Emotional Patterns\n{patterns}\n\n\
         ## Active Transformations\n{transformations}\n\n\
         ## Current Emotional State\n  - primary_emotion: {emotion}\n  - valence: {valence:.2}\n  - arousal: {arousal:.2}\n\n\
         ## Urgent Drives\n{drives}\n\n\
         ## Energy\nAvailable: {energy_current}\nMax: {energy_max}\n\n\
         ## Allowed Actions\n{allowed}\n\n\
         ## Action Costs\n{costs}\n\n\
         ---\n\nWhat do you want to do this heartbeat? Respond with STRICT JSON.",
        number = context["heartbeat_number"].as_i64().unwrap_or(0),
        timestamp = env["timestamp"].as_str().unwrap_or("Unknown"),
        dow = env["day_of_week"].as_str().unwrap_or("?"),
        hour = env["hour_of_day"].as_i64().unwrap_or(0),
        emotion = emotional["primary_emotion"].as_str().unwrap_or("neutral"),
        valence = emotional["valence"].as_f64().unwrap_or(0.0),
        arousal = emotional["arousal"].as_f64().unwrap_or(0.0),
        energy_current = energy["current"].as_f64().unwrap_or(0.0),
        energy_max = energy["max"].as_f64().unwrap_or(0.0),
    )
}
