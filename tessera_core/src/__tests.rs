use std::time::Duration;
use std::time::SystemTime;

use rstest::rstest;
use serde_json::json;
use similar_asserts::assert_eq;
use tracing_test::traced_test;

use super::__fixtures::*;
use super::*;
use crate::cache::BoundedCache;
use crate::evaluator::Budget;
use crate::filters::parse_filter;
use crate::filters::split_pipes;
use crate::lexer::parse_attributes;
use crate::security::encode_output;
use crate::security::validate_condition;
use crate::security::validate_expression;
use crate::security::validate_file_path;
use crate::security::validate_property_path;
use crate::security::validate_template;

// --- Scanner tests ---

#[test]
fn scan_text_and_interpolation() {
	let tokens = scan("Hi {{ name }}!");
	let kinds: Vec<TokenKind> = tokens.iter().map(|token| token.kind).collect();
	assert_eq!(
		kinds,
		vec![TokenKind::Text, TokenKind::Interpolation, TokenKind::Text]
	);
	assert_eq!(tokens[1].value, "name");
	assert_eq!(tokens[1].offset, 3);
	assert_eq!(tokens[2].offset, 13);
}

#[rstest]
#[case::lowercase_html("<if condition=\"a\">x</if>")]
#[case::unknown_tag("<Iffy>x</Iffy>")]
#[case::unterminated_interpolation("{{ name")]
#[case::comment("<!-- <If condition=\"x\">{{ y }}</If> -->")]
#[case::tag_without_end("<If condition=\"x\"")]
fn scan_degrades_to_text(#[case] input: &str) {
	let tokens = scan(input);
	assert_eq!(tokens.len(), 1);
	assert_eq!(tokens[0].kind, TokenKind::Text);
	assert_eq!(tokens[0].value, input);
}

#[test]
fn scan_quoted_angle_bracket_does_not_end_tag() {
	let tokens = scan("<If condition=\"Count > 10\">Big</If>");
	assert_eq!(tokens[0].kind, TokenKind::OpenTag(TagName::If));
	assert_eq!(
		tokens[0]
			.meta
			.as_ref()
			.and_then(|meta| meta.condition.as_deref()),
		Some("Count > 10")
	);
	assert_eq!(tokens[1].value, "Big");
	assert_eq!(tokens[2].kind, TokenKind::CloseTag(TagName::If));
}

#[test]
fn scan_loop_spec_and_self_closing() {
	let tokens = scan("<ForEach var=\"item\" in=\"Items\"><Param name=\"a\" value=\"b\"/></ForEach>");
	assert_eq!(
		tokens[0]
			.meta
			.as_ref()
			.and_then(|meta| meta.loop_spec.as_deref()),
		Some("item|Items")
	);
	assert_eq!(tokens[1].kind, TokenKind::SelfClosingTag(TagName::Param));
	assert_eq!(tokens[1].attribute("VALUE"), Some("b"));
}

#[test]
fn scan_tracks_lines() {
	let tokens = scan("one\ntwo\n{{ three }}");
	assert_eq!(tokens[0].line, 1);
	assert_eq!(tokens[1].line, 3);
}

#[test]
fn scan_tag_names_ignore_case_after_the_first_letter() {
	let tokens = scan("<FOREACH var=\"x\" in=\"y\"></FOREACH>");
	assert_eq!(tokens[0].kind, TokenKind::OpenTag(TagName::ForEach));
	assert_eq!(tokens[1].kind, TokenKind::CloseTag(TagName::ForEach));
}

#[rstest]
#[case::quoted("a=\"x\" b='y'", &[("a", "x"), ("b", "y")])]
#[case::escaped_double_quote("condition=\"Name == \\\"Ada\\\"\"", &[("condition", "Name == \"Ada\"")])]
#[case::escaped_single_quote("t='it\\'s'", &[("t", "it's")])]
#[case::unknown_escape_kept("p=\"C:\\d\"", &[("p", "C:\\d")])]
#[case::unquoted_path("href=/a/b", &[("href", "/a/b")])]
#[case::unquoted_before_self_close("value=x/", &[("value", "x")])]
#[case::bare_and_spaced("required  name = \"s\"", &[("required", ""), ("name", "s")])]
fn parse_attribute_lists(#[case] source: &str, #[case] expected: &[(&str, &str)]) {
	let attributes = parse_attributes(source);
	let pairs: Vec<(&str, &str)> = attributes
		.iter()
		.map(|attribute| (attribute.name.as_str(), attribute.value.as_str()))
		.collect();
	assert_eq!(pairs, expected.to_vec());
}

#[test]
fn scan_escaped_quote_keeps_tag_open() {
	let tokens = scan("<If condition=\"Name == \\\"a>b\\\"\">yes</If>");
	assert_eq!(tokens[0].kind, TokenKind::OpenTag(TagName::If));
	assert_eq!(
		tokens[0]
			.meta
			.as_ref()
			.and_then(|meta| meta.condition.as_deref()),
		Some("Name == \"a>b\"")
	);
	assert_eq!(tokens[1].value, "yes");
}

// --- Parser tests ---

fn text(value: &str) -> Node {
	Node::Text(value.to_string())
}

#[test]
fn parse_conditional_branches() {
	let root = parse_str("<If condition=\"a\">A<ElseIf condition=\"b\">B<Else>C</If>");
	let expected = Root::new(vec![Node::Conditional {
		branches: vec![
			Branch {
				condition: "a".to_string(),
				children: vec![text("A")],
			},
			Branch {
				condition: "b".to_string(),
				children: vec![text("B")],
			},
		],
		otherwise: Some(vec![text("C")]),
	}]);
	assert_eq!(root, expected);
}

#[test]
fn parse_unterminated_conditional_ends_at_input_end() {
	let root = parse_str("<If condition=\"a\">abc");
	let expected = Root::new(vec![Node::Conditional {
		branches: vec![Branch {
			condition: "a".to_string(),
			children: vec![text("abc")],
		}],
		otherwise: None,
	}]);
	assert_eq!(root, expected);
}

#[test]
fn parse_stray_close_tag_is_text() {
	assert_eq!(parse_str("a</If>b").children, vec![text("a</If>b")]);
}

#[test]
fn parse_loop() {
	let root = parse_str("<ForEach var=\"x\" in=\"Items\">[{{ x }}]</ForEach>");
	let expected = Root::new(vec![Node::Loop {
		variable: "x".to_string(),
		collection: "Items".to_string(),
		children: vec![
			text("["),
			Node::Interpolation("x".to_string()),
			text("]"),
		],
	}]);
	assert_eq!(root, expected);
}

#[test]
fn parse_component_stream() {
	let root = parse_str(
		"<Include component=\"card\" name=\"c1\" Title=\"Hi\"><Param name=\"Size\" value=\"2\" \
		 default=\"1\"/><Slot name=\"header\">H</Slot>body</Include>",
	);
	let expected = Root::new(vec![Node::Component(ComponentRef {
		kind: ComponentKind::Include,
		component: "card".to_string(),
		name: Some("c1".to_string()),
		old_name: None,
		parameters: vec![
			Parameter {
				name: "Size".to_string(),
				value: "2".to_string(),
				default: Some("1".to_string()),
			},
			Parameter {
				name: "Title".to_string(),
				value: "Hi".to_string(),
				default: None,
			},
		],
		default_slot: vec![text("body")],
		slots: vec![("header".to_string(), vec![text("H")])],
	})]);
	assert_eq!(root, expected);
}

#[test]
fn parse_container_component_path_is_type_prefixed() {
	let root = parse_str("<Nav component=\"main\"/><Block>plain</Block>");
	assert_eq!(root.component_refs(), vec!["nav/main".to_string()]);
	assert_eq!(
		root.children[1],
		Node::Container {
			tag: TagName::Block,
			attributes: Attributes::default(),
			children: vec![text("plain")],
		}
	);
}

#[test]
fn parse_fragment_define_and_invoke() {
	let root = parse_str("<Define name=\"f\">x</Define><Render name=\"f\" a=\"1\"/>");
	let expected = Root::new(vec![
		Node::FragmentDefine {
			name: "f".to_string(),
			body: vec![text("x")],
		},
		Node::FragmentInvoke {
			name: "f".to_string(),
			parameters: vec![Parameter {
				name: "a".to_string(),
				value: "1".to_string(),
				default: None,
			}],
		},
	]);
	assert_eq!(root, expected);
}

#[test]
fn parse_indexes_sections() {
	let root = parse_str(
		"<Layout name=\"main\"><Section name=\"Title\">T</Section><Section \
		 name=\"aside\">A</Section></Layout>",
	);
	assert_eq!(root.section_names(), vec!["aside", "title"]);
	assert!(matches!(
		root.section("TITLE"),
		Some(Node::Section { name, .. }) if name == "Title"
	));
	assert!(root.section("missing").is_none());
}

#[test]
fn parse_self_closing_layout_adopts_siblings() {
	let root = parse_str("<Layout name=\"main\"/>a{{ b }}");
	let expected = Root::new(vec![Node::Layout {
		name: "main".to_string(),
		children: vec![text("a"), Node::Interpolation("b".to_string())],
	}]);
	assert_eq!(root, expected);
}

fn container_depth(nodes: &[Node]) -> usize {
	nodes
		.iter()
		.map(|node| {
			match node {
				Node::Container { children, .. } => 1 + container_depth(children),
				_ => 0,
			}
		})
		.max()
		.unwrap_or(0)
}

#[test]
fn parse_stops_descending_past_the_depth_cap() {
	let source = format!("{}x{}", "<Block>".repeat(5_000), "</Block>".repeat(5_000));
	let root = parse_str(&source);
	assert_eq!(container_depth(&root.children), MAX_PARSE_DEPTH);
}

#[test]
fn parse_render_section_required_flag() {
	let root = parse_str("<RenderSection name=\"x\" required=\"TRUE\"/>");
	assert_eq!(
		root.children,
		vec![Node::RenderSection {
			name: "x".to_string(),
			required: true,
			default: Vec::new(),
		}]
	);
}

// --- Security gate tests ---

#[rstest]
#[case::type_reference("System.IO.File.ReadAllText")]
#[case::reflection("user.GetType().Name")]
#[case::sql("name; DROP TABLE users")]
#[case::call("format(name)")]
#[case::command_substitution("$(whoami)")]
#[case::script_marker("javascript:alert")]
#[case::nul("name\0")]
#[case::environment("Environment.UserName")]
fn validate_expression_rejects(#[case] expression: &str) {
	let result = validate_expression(expression, &SecurityConfig::default());
	assert!(
		matches!(result, Err(TesseraError::UnsafeExpression { .. })),
		"{expression:?} gave {result:?}"
	);
}

#[rstest]
#[case::path("User.Profile.Name")]
#[case::comparison("Count > 10 && Name == 'Ada'")]
#[case::grouping("(a or b) and not c")]
#[case::quoted_call("'format(x)'")]
#[case::filter("Name | default:\"none\"")]
#[case::indexer("Items[0].Name")]
fn validate_expression_accepts(#[case] expression: &str) -> TesseraResult<()> {
	validate_expression(expression, &SecurityConfig::default())
}

#[test]
fn validate_expression_length_limit() {
	let long = "a".repeat(1001);
	let result = validate_expression(&long, &SecurityConfig::default());
	assert!(matches!(
		result,
		Err(TesseraError::LimitExceeded {
			limit: "max_expression_length",
			configured: 1000,
			actual: 1001,
		})
	));
}

#[test]
fn validate_expression_allowed_function_and_disabled_indexers() {
	let config = SecurityConfig {
		allowed_functions: vec!["Format".to_string()],
		allow_indexers: false,
		..SecurityConfig::default()
	};
	assert!(validate_expression("format(x)", &config).is_ok());
	assert!(matches!(
		validate_expression("Items[0]", &config),
		Err(TesseraError::UnsafeExpression { .. })
	));
}

#[rstest]
#[case::equal("a == b", true)]
#[case::not_equal("a != b", true)]
#[case::less_equal("a <= b", true)]
#[case::greater_equal("a >= b", true)]
#[case::quoted("name == 'x=y'", true)]
#[case::assignment("a = b", false)]
#[case::trailing("a =", false)]
fn validate_condition_assignments(#[case] condition: &str, #[case] allowed: bool) {
	let result = validate_condition(condition, &SecurityConfig::default());
	if allowed {
		assert!(result.is_ok(), "{condition:?} gave {result:?}");
	} else {
		assert!(matches!(result, Err(TesseraError::UnsafeCondition { .. })));
	}
}

#[test]
fn validate_condition_maps_expression_failures() {
	let result = validate_condition("System.Exit", &SecurityConfig::default());
	assert!(matches!(result, Err(TesseraError::UnsafeCondition { .. })));
}

#[test]
fn validate_property_paths() {
	let config = SecurityConfig::default();
	assert!(validate_property_path("User.Address.City", &config).is_ok());
	assert!(matches!(
		validate_property_path("User..City", &config),
		Err(TesseraError::UnsafePropertyPath { .. })
	));
	assert!(matches!(
		validate_property_path("User.PASSWORD", &config),
		Err(TesseraError::UnsafePropertyPath { .. })
	));

	let deep = vec!["a"; 11].join(".");
	assert!(matches!(
		validate_property_path(&deep, &config),
		Err(TesseraError::LimitExceeded {
			limit: "max_property_depth",
			..
		})
	));
}

#[test]
fn validate_file_path_inside_root() -> TesseraResult<()> {
	let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
	write_file(tmp.path(), "pages/index.html", "hi");
	let config = EngineConfig::default()
		.with_template_root(tmp.path())
		.security;

	let resolved = validate_file_path(&tmp.path().join("pages/index.html"), &config)?;
	assert!(resolved.is_absolute());
	assert!(resolved.ends_with("pages/index.html"));

	Ok(())
}

#[rstest]
#[case::parent_inside_root("pages/../pages/index.html")]
#[case::parent_outside_root("../index.html")]
#[case::encoded_dot("pages/%2e%2e/index.html")]
#[case::encoded_slash("pages%2Findex.html")]
#[case::doubled_slash("pages//index.html")]
#[case::home("~/index.html")]
#[case::extension("pages/index.txt")]
fn validate_file_path_rejects(#[case] relative: &str) {
	let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
	write_file(tmp.path(), "pages/index.html", "hi");
	write_file(tmp.path(), "pages/index.txt", "hi");
	let config = EngineConfig::default()
		.with_template_root(tmp.path())
		.security;

	let path = format!("{}/{relative}", tmp.path().display());
	let result = validate_file_path(std::path::Path::new(&path), &config);
	assert!(
		matches!(result, Err(TesseraError::UnsafeFilePath { .. })),
		"{relative:?} gave {result:?}"
	);
}

#[test]
fn validate_file_path_fails_closed_without_roots() {
	let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
	write_file(tmp.path(), "index.html", "hi");

	let result = validate_file_path(&tmp.path().join("index.html"), &SecurityConfig::default());
	assert!(matches!(result, Err(TesseraError::UnsafeFilePath { .. })));
}

#[test]
fn validate_file_path_outside_every_root() {
	let allowed = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
	let other = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
	write_file(other.path(), "index.html", "hi");
	let config = EngineConfig::default()
		.with_template_root(allowed.path())
		.security;

	let result = validate_file_path(&other.path().join("index.html"), &config);
	assert!(matches!(result, Err(TesseraError::UnsafeFilePath { .. })));
}

#[test]
fn validate_template_limits_in_order() {
	let mut config = SecurityConfig::default();
	config.limits.max_interpolations = 2;
	config.limits.max_nesting_depth = 2;

	assert!(matches!(
		validate_template("{{a}}{{b}}{{c}}", &config),
		Err(TesseraError::LimitExceeded {
			limit: "max_interpolations",
			configured: 2,
			actual: 3,
		})
	));
	assert!(matches!(
		validate_template("<div><p><b>x</b></p></div>", &config),
		Err(TesseraError::LimitExceeded {
			limit: "max_nesting_depth",
			..
		})
	));
	assert!(validate_template("<div><br><img src=\"a\"><p>x</p></div>", &config).is_ok());
}

#[rstest]
#[case::branch_markers("<If condition=\"a\">x<ElseIf condition=\"b\">y<Else>z</If>")]
#[case::sibling_closed_items("<ul><li>a<li>b<li>c</ul>")]
#[case::unclosed_paragraphs("<p>a<p>b<p>c")]
#[case::closing_tag_closes_inner("<div><span>a</div><div><span>b</div>")]
#[case::commented_markup("<!-- <div><div><div> --><b>x</b>")]
fn validate_template_nesting_ignores_unscoped_tags(#[case] template: &str) {
	let mut config = SecurityConfig::default();
	config.limits.max_nesting_depth = 2;
	assert!(validate_template(template, &config).is_ok());
}

#[test]
fn validate_template_accepts_long_flat_pages() {
	let page = "<If condition=\"a\">x<Else>y</If>\n".repeat(101);
	assert!(validate_template(&page, &SecurityConfig::default()).is_ok());
}

#[test]
fn validate_template_counts_tags_with_quoted_closers() {
	let template = format!(
		"{}x{}",
		"<Block a=\"/>\">".repeat(150),
		"</Block>".repeat(150)
	);
	assert!(matches!(
		validate_template(&template, &SecurityConfig::default()),
		Err(TesseraError::LimitExceeded {
			limit: "max_nesting_depth",
			configured: 100,
			actual: 150,
		})
	));

	let result = Engine::default().render(&template, &Variables::new());
	assert!(matches!(
		result,
		Err(TesseraError::LimitExceeded {
			limit: "max_nesting_depth",
			..
		})
	));
}

#[rstest]
#[case::script_tag("<SCRIPT>alert(1)</SCRIPT>")]
#[case::event_handler("<img src=\"x\" onerror=\"alert(1)\">")]
fn validate_template_rejects_inline_scripts(#[case] template: &str) {
	let result = validate_template(template, &SecurityConfig::default());
	assert!(matches!(result, Err(TesseraError::UnsafeTemplate { .. })));

	let permissive = SecurityConfig {
		allow_inline_scripts: true,
		..SecurityConfig::default()
	};
	assert!(validate_template(template, &permissive).is_ok());
}

#[rstest]
#[case::html_only(true, false, false, "<b>\"x\" & 'y'</b>", "&lt;b&gt;&quot;x&quot; &amp; &#39;y&#39;&lt;/b&gt;")]
#[case::strip_tags(true, true, false, "<b>bold</b>", "bold")]
#[case::script_only(false, false, true, "a\"b</script>", "a\\\"b<\\/script>")]
#[case::raw(false, false, false, "<i>x</i>", "<i>x</i>")]
fn encode_output_modes(
	#[case] html_encode: bool,
	#[case] strip_tags: bool,
	#[case] script_encode: bool,
	#[case] input: &str,
	#[case] expected: &str,
) {
	let encoding = OutputEncoding {
		html_encode,
		strip_tags,
		script_encode,
	};
	assert_eq!(encode_output(input, &encoding), expected);
}

// --- Value and resolver tests ---

#[rstest]
#[case::null(json!(null), false)]
#[case::bool_true(json!(true), true)]
#[case::bool_false(json!(false), false)]
#[case::zero(json!(0), false)]
#[case::nonzero(json!(-2), true)]
#[case::float_zero(json!(0.0), false)]
#[case::empty_string(json!(""), false)]
#[case::false_string(json!("FALSE"), false)]
#[case::null_string(json!("Null"), false)]
#[case::zero_string(json!("0"), false)]
#[case::text(json!("no"), true)]
#[case::empty_list(json!([]), false)]
#[case::list(json!([0]), true)]
#[case::empty_map(json!({}), false)]
#[case::map(json!({"a": 1}), true)]
fn truthiness_table(#[case] value: serde_json::Value, #[case] expected: bool) -> TesseraResult<()> {
	assert_eq!(Value::from(value.clone()).is_truthy(), expected);

	let engine = Engine::default();
	let output = engine.render(
		"<If condition=\"V\">T<Else>F</If>",
		&variables(json!({ "V": value })),
	)?;
	assert_eq!(output, if expected { "T" } else { "F" });

	Ok(())
}

#[test]
fn unbound_condition_is_false() -> TesseraResult<()> {
	let output = Engine::default().render(
		"<If condition=\"Missing.Deep.Path\">T<Else>F</If>",
		&Variables::new(),
	)?;
	assert_eq!(output, "F");
	Ok(())
}

#[test]
fn host_object_members() -> TesseraResult<()> {
	let engine = Engine::default();
	let mut data = Variables::new();
	data.insert("Account", account());

	let output = engine.render(
		"{{ Account.Name }}|{{ Account.visits }}|{{ Account.Greeting }}|{{ Account.Password \
		 }}|{{ Account[1] }}|{{ Account.Unknown }}",
		&data,
	)?;
	assert_eq!(output, "Ada|3|Hello, Ada||3|");
	assert!(accessor_cache_len() >= 1);

	Ok(())
}

#[test]
fn resolve_member_on_maps_and_lists() {
	let map = Value::from(json!({ "Title": "x" }));
	assert_eq!(resolve_member(&map, "title"), Some(Value::from("x")));
	assert_eq!(resolve_member(&map, "Count"), Some(Value::from(1_i64)));

	let list = Value::from(json!(["a", "b"]));
	assert_eq!(resolve_member(&list, "Length"), Some(Value::from(2_i64)));
	assert_eq!(resolve_index(&list, &Value::from("1")), Some(Value::from("b")));
	assert_eq!(resolve_index(&list, &Value::from(-1_i64)), None);
	assert_eq!(resolve_index(&list, &Value::from(5_i64)), None);
}

#[test]
fn resolve_path_stops_at_blocked_and_missing_segments() {
	let security = SecurityConfig::default();
	let root = Value::from(json!({ "User": { "ApiKey": "k", "Name": "n" } }));
	assert_eq!(
		resolve_path(&root, &["User", "Name"], &security),
		Some(Value::from("n"))
	);
	assert_eq!(resolve_path(&root, &["User", "apikey"], &security), None);
	assert_eq!(resolve_path(&root, &["User", "Age", "Years"], &security), None);
}

#[test]
fn variables_ignore_case_and_fingerprint_is_stable() {
	let mut first = Variables::new();
	first.insert("Name", "Ada");
	first.insert("Count", 2_i64);
	assert_eq!(first.get("NAME"), Some(&Value::from("Ada")));

	let mut second = Variables::new();
	second.insert("count", 2_i64);
	second.insert("name", "Ada");
	assert_eq!(first.fingerprint(), second.fingerprint());

	second.insert("Name", "Bob");
	assert_ne!(first.fingerprint(), second.fingerprint());

	let changed = second.changed_since(&first);
	assert_eq!(changed.len(), 1);
	assert_eq!(changed.get("name"), Some(&Value::from("Bob")));
}

// --- Expression tests ---

struct Fixed(Variables);

impl Bindings for Fixed {
	fn lookup(&self, reference: &str) -> TesseraResult<Option<Value>> {
		Ok(self.0.get(reference).cloned())
	}
}

#[rstest]
#[case::precedence("1 + 2 * 3", Some(Value::Int(7)))]
#[case::grouping("(1 + 2) * 3", Some(Value::Int(9)))]
#[case::fraction("10 / 4", Some(Value::Float(2.5)))]
#[case::exact_division("10 / 5", Some(Value::Int(2)))]
#[case::division_by_zero("1 / 0", None)]
#[case::logic("Count > 10 && Name == 'Ada'", Some(Value::Bool(true)))]
#[case::words("not Flag and true", Some(Value::Bool(true)))]
#[case::concat("'a' + 1", Some(Value::from("a1")))]
#[case::null_equality("Missing == null", Some(Value::Bool(true)))]
#[case::numeric_string("'15' == Count", Some(Value::Bool(true)))]
#[case::negation("-Count", Some(Value::Int(-15)))]
#[case::syntax_error("1 +", None)]
#[case::leftover_tokens("Count Name", None)]
#[case::unbound("Missing", None)]
fn evaluate_expressions(#[case] text: &str, #[case] expected: Option<Value>) -> TesseraResult<()> {
	let bindings = Fixed(variables(json!({ "Count": 15, "Name": "Ada", "Flag": false })));
	assert_eq!(expression::evaluate(text, &bindings)?, expected);
	Ok(())
}

// --- Filter tests ---

#[test]
fn split_pipes_ignores_logical_or_and_quotes() {
	assert_eq!(split_pipes("a || b"), vec!["a || b"]);
	assert_eq!(split_pipes("a | upper"), vec!["a ", " upper"]);
	assert_eq!(split_pipes("a | default:\"x|y\""), vec!["a ", " default:\"x|y\""]);
}

#[test]
fn parse_filter_arguments() {
	assert_eq!(parse_filter(" upper "), ("upper", Vec::new()));
	assert_eq!(
		parse_filter("default:\"x, y\",2"),
		("default", vec!["\"x, y\"", "2"])
	);
}

#[rstest]
#[case::upper("{{ Name | upper }}", "ADA")]
#[case::chained("{{ Name | upper | length }}", "3")]
#[case::default_used("{{ Missing | default:\"none\" }}", "none")]
#[case::default_unused("{{ Name | default:\"none\" }}", "Ada")]
#[case::default_from_variable("{{ Missing | default:Name }}", "Ada")]
#[case::unknown_is_identity("{{ Name | nosuchfilter }}", "Ada")]
#[case::trim("{{ Padded | trim }}", "x")]
fn builtin_filters(#[case] template: &str, #[case] expected: &str) -> TesseraResult<()> {
	let output = Engine::default().render(
		template,
		&variables(json!({ "Name": "Ada", "Padded": "  x  " })),
	)?;
	assert_eq!(output, expected);
	Ok(())
}

#[test]
fn engine_filters_shadow_global_filters() -> TesseraResult<()> {
	register_filter("tessera_tests_mark", |value, _| Value::from(format!("global:{value}")));
	let shadowing = Engine::default();
	shadowing.register_filter("tessera_tests_mark", |value, _| Value::from(format!("local:{value}")));
	let plain = Engine::default();

	let data = variables(json!({ "Name": "Ada" }));
	assert_eq!(
		shadowing.render("{{ Name | tessera_tests_mark }}", &data)?,
		"local:Ada"
	);
	assert_eq!(
		plain.render("{{ Name | tessera_tests_mark }}", &data)?,
		"global:Ada"
	);
	assert!(global_filters().unregister("tessera_tests_mark"));

	Ok(())
}

// --- Evaluator tests ---

#[test]
fn scenario_hello() -> TesseraResult<()> {
	let output = Engine::default().render("Hello {{Name}}!", &variables(json!({ "Name": "John" })))?;
	assert_eq!(output, "Hello John!");
	Ok(())
}

#[test]
fn scenario_output_is_encoded() -> TesseraResult<()> {
	let output = Engine::default().render(
		"{{Input}}",
		&variables(json!({ "Input": "<script>alert(1)</script>" })),
	)?;
	assert_eq!(output, "&lt;script&gt;alert(1)&lt;/script&gt;");
	Ok(())
}

#[test]
fn scenario_loop() -> TesseraResult<()> {
	let output = Engine::default().render(
		"<ForEach var=\"x\" in=\"Items\">[{{x}}]</ForEach>",
		&variables(json!({ "Items": ["A", "B", "C"] })),
	)?;
	assert_eq!(output, "[A][B][C]");
	Ok(())
}

#[rstest]
#[case::big(15, "Big")]
#[case::small(5, "")]
fn scenario_comparison(#[case] count: i64, #[case] expected: &str) -> TesseraResult<()> {
	let output = Engine::default().render(
		"<If condition=\"Count > 10\">Big</If>",
		&variables(json!({ "Count": count })),
	)?;
	assert_eq!(output, expected);
	Ok(())
}

#[test]
fn scenario_recursive_fragment_over_three_levels() -> TesseraResult<()> {
	let template = "<Define name=\"branch\"><li>{{ item.Name }}<ForEach var=\"child\" \
	                in=\"item.Children\"><Render name=\"branch\" \
	                item=\"{{child}}\"/></ForEach></li></Define><Render name=\"branch\" \
	                item=\"{{Tree}}\"/>";
	let mut data = Variables::new();
	data.insert("Tree", three_level_tree());

	let output = Engine::default().render(template, &data)?;
	insta::assert_snapshot!(output, @"<li>Root<li>Branch<li>Leaf</li></li></li>");
	for name in ["Root", "Branch", "Leaf"] {
		assert_eq!(output.matches(name).count(), 1);
	}

	Ok(())
}

#[test]
fn scenario_size_limit_before_tokenization() {
	let mut config = EngineConfig::default();
	config.security.limits.max_template_size = 10;
	let engine = Engine::new(config);

	let result = engine.render("{{ a }}{{ b }}", &Variables::new());
	assert!(matches!(
		result,
		Err(TesseraError::LimitExceeded {
			limit: "max_template_size",
			configured: 10,
			actual: 14,
		})
	));
	assert_eq!(engine.cache_stats().templates.entries, 0);
}

#[rstest]
#[case::high(15, "Big")]
#[case::middle(5, "Mid")]
#[case::low(1, "Small")]
fn else_if_chain(#[case] count: i64, #[case] expected: &str) -> TesseraResult<()> {
	let output = Engine::default().render(
		"<If condition=\"Count > 10\">Big<ElseIf condition=\"Count > 3\">Mid<Else>Small</If>",
		&variables(json!({ "Count": count })),
	)?;
	assert_eq!(output, expected);
	Ok(())
}

#[rstest]
#[case::bound(json!({ "x": "outer", "Items": ["A", "B"] }), "AB|outer")]
#[case::unbound(json!({ "Items": ["A", "B"] }), "AB|")]
fn loop_variable_is_restored(
	#[case] data: serde_json::Value,
	#[case] expected: &str,
) -> TesseraResult<()> {
	let output = Engine::default().render(
		"<ForEach var=\"x\" in=\"Items\">{{x}}</ForEach>|{{x}}",
		&variables(data),
	)?;
	assert_eq!(output, expected);
	Ok(())
}

#[test]
fn loop_over_map_yields_key_value_entries() -> TesseraResult<()> {
	let output = Engine::default().render(
		"<ForEach var=\"e\" in=\"Prices\">{{ e.Key }}={{ e.Value }};</ForEach>",
		&variables(json!({ "Prices": { "b": 2, "a": 1 } })),
	)?;
	assert_eq!(output, "a=1;b=2;");
	Ok(())
}

#[test]
fn loop_over_non_enumerable_renders_nothing() -> TesseraResult<()> {
	let output = Engine::default().render(
		"<ForEach var=\"x\" in=\"Count\">{{x}}</ForEach>done",
		&variables(json!({ "Count": 3 })),
	)?;
	assert_eq!(output, "done");
	Ok(())
}

#[test]
fn loop_iteration_limit() {
	let mut config = EngineConfig::default();
	config.security.limits.max_loop_iterations = 2;
	let result = Engine::new(config).render(
		"<ForEach var=\"x\" in=\"Items\">{{x}}</ForEach>",
		&variables(json!({ "Items": [1, 2, 3] })),
	);
	assert!(matches!(
		result,
		Err(TesseraError::LimitExceeded {
			limit: "max_loop_iterations",
			configured: 2,
			actual: 3,
		})
	));
}

#[test]
fn indexers_and_members() -> TesseraResult<()> {
	let data = variables(json!({
		"Items": ["A", "B", "C"],
		"Users": [{ "Name": "Ada" }],
		"Lookup": { "key": "value" },
		"Position": 2,
	}));
	let output = Engine::default().render(
		"{{ Items[1] }}|{{ Users[0].Name }}|{{ Lookup[\"key\"] }}|{{ Items[Position] }}|{{ \
		 Items.Count }}|{{ Items[9] }}",
		&data,
	)?;
	assert_eq!(output, "B|Ada|value|C|3|");
	Ok(())
}

#[test]
fn arithmetic_interpolation() -> TesseraResult<()> {
	let output = Engine::default().render(
		"{{ Price * Quantity }}",
		&variables(json!({ "Price": 2, "Quantity": 3 })),
	)?;
	assert_eq!(output, "6");
	Ok(())
}

#[test]
fn blocked_members_resolve_to_nothing() -> TesseraResult<()> {
	let data = variables(json!({ "User": { "Name": "Ada", "Password": "hunter2" } }));
	let output = Engine::default().render(
		"[{{ User.Password }}]<If condition=\"User.password\">leak</If>",
		&data,
	)?;
	assert_eq!(output, "[]");
	Ok(())
}

#[test]
fn fail_closed_on_type_reference() {
	let engine = Engine::default();
	for template in [
		"{{ System.IO.File.ReadAllText }}",
		"<If condition=\"Process.Start\">x</If>",
		"<ForEach var=\"x\" in=\"Directory.GetFiles\">{{x}}</ForEach>",
	] {
		let result = engine.render(template, &Variables::new());
		assert!(
			result
				.as_ref()
				.is_err_and(TesseraError::is_security_violation),
			"{template:?} gave {result:?}"
		);
	}
}

#[test]
fn assignment_in_condition_is_rejected() {
	let result = Engine::default().render(
		"<If condition=\"Count = 5\">x</If>",
		&variables(json!({ "Count": 5 })),
	);
	assert!(matches!(result, Err(TesseraError::UnsafeCondition { .. })));
}

#[test]
fn longest_prefix_wins_for_dotted_names() -> TesseraResult<()> {
	let mut data = Variables::new();
	data.insert("A.B", json!({ "C": "from-literal-key" }));
	data.insert("A", json!({ "B": { "C": "from-member-path" } }));
	let engine = Engine::default();
	assert_eq!(engine.render("{{ A.B.C }}", &data)?, "from-literal-key");

	let mut direct = Variables::new();
	direct.insert("A.B", "literal");
	direct.insert("A", json!({ "B": "member" }));
	assert_eq!(engine.render("{{A.B}}", &direct)?, "literal");

	Ok(())
}

#[test]
fn fragment_parameters_do_not_leak() -> TesseraResult<()> {
	let output = Engine::default().render(
		"<Define name=\"f\">{{ X }}</Define>{{ X }}<Render name=\"f\" X=\"inner\"/>{{ X }}",
		&variables(json!({ "X": "outer" })),
	)?;
	assert_eq!(output, "outerinnerouter");
	Ok(())
}

#[test]
fn fragment_forward_reference_and_first_definition_wins() -> TesseraResult<()> {
	let output = Engine::default().render(
		"<Render name=\"f\"/><Define name=\"f\">one</Define><Define name=\"F\">two</Define>",
		&Variables::new(),
	)?;
	assert_eq!(output, "one");
	Ok(())
}

#[test]
fn unbounded_fragment_recursion_hits_the_limit() {
	let result = Engine::default().render(
		"<Define name=\"f\">x<Render name=\"f\"/></Define><Render name=\"f\"/>",
		&Variables::new(),
	);
	assert!(matches!(
		result,
		Err(TesseraError::LimitExceeded {
			limit: "max_recursion_depth",
			configured: 50,
			..
		})
	));
}

#[test]
#[traced_test]
fn undefined_fragment_renders_diagnostic() -> TesseraResult<()> {
	let output = Engine::default().render("a<Render name=\"ghost\"/>b", &Variables::new())?;
	assert_eq!(output, "a<!-- tessera: fragment `ghost` is not defined -->b");
	assert!(logs_contain("fragment `ghost` is not defined"));
	Ok(())
}

#[test]
fn budget_scopes_restore_on_drop() -> TesseraResult<()> {
	let budget = Budget::default();
	{
		let outer = budget.loop_scope(3);
		outer.charge()?;
		outer.charge()?;
		{
			let inner = budget.loop_scope(3);
			inner.charge()?;
			assert!(inner.charge().is_err());
			assert_eq!(budget.loop_iterations(), 3);
		}
		assert_eq!(budget.loop_iterations(), 2);
	}
	assert_eq!(budget.loop_iterations(), 0);
	assert_eq!(budget.recursion_depth(), 0);
	Ok(())
}

#[test]
fn budget_is_restored_after_failure_inside_nested_include() -> TesseraResult<()> {
	let mut config = EngineConfig::default();
	config.security.limits.max_loop_iterations = 3;
	let engine = engine_with_loader(
		config,
		memory_loader(&[
			("outer", "<Include component=\"exhaust\"/>"),
			("exhaust", "<ForEach var=\"n\" in=\"Many\">{{n}}</ForEach>"),
		]),
	);

	let output = engine.render(
		"<Include component=\"outer\"/>|<ForEach var=\"x\" in=\"Few\">{{x}}</ForEach>",
		&variables(json!({ "Many": [1, 2, 3, 4, 5], "Few": [1, 2, 3] })),
	)?;
	assert_eq!(
		output,
		"<!-- tessera: component `exhaust` failed: limit `max_loop_iterations` exceeded: \
		 configured 3, got 4 -->|123"
	);

	Ok(())
}

#[test]
fn purity_across_cold_and_warm_caches() -> TesseraResult<()> {
	let engine = Engine::default();
	let template = "<ForEach var=\"x\" in=\"Items\"><If condition=\"x > 1\">{{x}}</If></ForEach>";
	let data = variables(json!({ "Items": [1, 2, 3] }));

	let cold = engine.render(template, &data)?;
	let warm = engine.render(template, &data)?;
	engine.clear_caches();
	let cleared = engine.render(template, &data)?;

	assert_eq!(cold, "23");
	assert_eq!(cold, warm);
	assert_eq!(cold, cleared);

	Ok(())
}

#[test]
fn concurrent_renders_share_one_engine() {
	let engine = Engine::default();
	let data = variables(json!({ "Items": ["a", "b"] }));
	std::thread::scope(|scope| {
		for _ in 0..8 {
			scope.spawn(|| {
				for _ in 0..25 {
					let output = engine
						.render("<ForEach var=\"x\" in=\"Items\">{{x | upper}}</ForEach>", &data)
						.unwrap_or_else(|e| panic!("render: {e}"));
					assert_eq!(output, "AB");
				}
			});
		}
	});
}

// --- Variable scope tests ---

#[test]
fn scope_priority_call_local_over_instance_over_global() -> TesseraResult<()> {
	set_global("tessera_tests_scope_title", "global")?;
	set_global("tessera_tests_scope_footer", "global-footer")?;
	let engine = Engine::default();
	engine.set_variable("tessera_tests_scope_title", "instance")?;

	let template = "{{ tessera_tests_scope_title }}|{{ tessera_tests_scope_footer }}";
	assert_eq!(engine.render(template, &Variables::new())?, "instance|global-footer");
	assert_eq!(
		engine.render(
			template,
			&variables(json!({ "tessera_tests_scope_title": "local" }))
		)?,
		"local|global-footer"
	);

	remove_global("tessera_tests_scope_title");
	remove_global("tessera_tests_scope_footer");
	assert!(!has_global("tessera_tests_scope_footer"));

	Ok(())
}

#[test]
fn blocked_names_cannot_be_bound() {
	assert!(matches!(
		set_global("ApiKey", "x"),
		Err(TesseraError::UnsafePropertyPath { .. })
	));
	assert!(matches!(
		Engine::default().set_variable("password", "x"),
		Err(TesseraError::UnsafePropertyPath { .. })
	));
}

// --- Component tests ---

#[test]
fn component_parameters_and_defaults() -> TesseraResult<()> {
	let engine = engine_with_components(&[("greet", "Hi {{ Who }}{{ Suffix }}")]);
	let data = variables(json!({ "Name": "Ada" }));

	let cases = [
		("<Include component=\"greet\" Who=\"{{ Name }}\"/>", "Hi Ada"),
		("<Include component=\"greet\" Who=\"Dr. {{ Name }}\"/>", "Hi Dr. Ada"),
		("<Include component=\"greet\" Who=\"Name\"/>", "Hi Ada"),
		("<Include component=\"greet\" Who=\"Stranger\"/>", "Hi Stranger"),
		(
			"<Include component=\"greet\"><Param name=\"Who\" value=\"{{ Missing }}\" \
			 default=\"friend\"/></Include>",
			"Hi friend",
		),
		(
			"<Include component=\"greet\"><Param name=\"Who\" value=\"\" default=\"{{ Name }}\"/><Param \
			 name=\"Suffix\" value=\"!\"/></Include>",
			"Hi Ada!",
		),
	];
	for (template, expected) in cases {
		assert_eq!(engine.render(template, &data)?, expected, "{template}");
	}

	Ok(())
}

#[test]
fn component_environment_is_a_copy() -> TesseraResult<()> {
	let engine = engine_with_components(&[("set", "{{ X }}<ForEach var=\"X\" in=\"Items\">{{X}}</ForEach>")]);
	let output = engine.render(
		"<Include component=\"set\" X=\"param\"/>|{{ X }}",
		&variables(json!({ "X": "page", "Items": ["i"] })),
	)?;
	assert_eq!(output, "parami|page");
	Ok(())
}

#[test]
fn component_slots() -> TesseraResult<()> {
	let engine = engine_with_components(&[(
		"card",
		"<div><Slot name=\"header\">Default header</Slot>|<Slot/>|<Slot name=\"footer\">no \
		 footer</Slot></div>",
	)]);

	let output = engine.render(
		"<Include component=\"card\"><Slot name=\"header\">Hello</Slot>Body {{ User \
		 }}</Include>",
		&variables(json!({ "User": "Ada" })),
	)?;
	insta::assert_snapshot!(output, @"<div>Hello|Body Ada|no footer</div>");

	Ok(())
}

#[test]
fn container_component_and_technical_variables() -> TesseraResult<()> {
	let engine = engine_with_components(&[
		("nav/main", "<nav>{{ Title }}:{{ _ComponentName }}:{{ _ComponentPath }}</nav>"),
		("outer", "[{{ _ComponentName }}<Include component=\"inner\"/>]"),
		("inner", "({{ _ComponentName }}{{ _ComponentOldName }})"),
	]);

	let output = engine.render(
		"<Nav component=\"main\" name=\"top\" Title=\"Home\"/><Include component=\"outer\" \
		 name=\"A\"/>",
		&Variables::new(),
	)?;
	assert_eq!(output, "<nav>Home:top:nav/main</nav>[A()]");

	Ok(())
}

#[test]
fn component_name_is_interpolated() -> TesseraResult<()> {
	let engine = engine_with_components(&[("who", "{{ _ComponentName }}/{{ _ComponentOldName }}")]);
	let output = engine.render(
		"<Include component=\"{{ Kind }}\" name=\"item-{{ Id }}\" oldname=\"legacy\"/>",
		&variables(json!({ "Kind": "who", "Id": 7 })),
	)?;
	assert_eq!(output, "item-7/legacy");
	Ok(())
}

#[test]
fn missing_component_renders_nothing() -> TesseraResult<()> {
	let engine = engine_with_components(&[]);
	let output = engine.render("a<Include component=\"nope\"/>b", &Variables::new())?;
	assert_eq!(output, "ab");
	Ok(())
}

#[test]
#[traced_test]
fn component_failure_is_contained() -> TesseraResult<()> {
	let engine = engine_with_components(&[
		("broken", "{{ System.Exit }}"),
		("fine", "ok"),
	]);
	let output = engine.render(
		"<Include component=\"broken\"/>|<Include component=\"fine\"/>",
		&Variables::new(),
	)?;
	assert!(output.starts_with("<!-- tessera: component `broken` failed: unsafe expression"));
	assert!(output.ends_with("-->|ok"));
	assert!(logs_contain("component `broken` failed"));
	Ok(())
}

#[test]
fn literal_parameters_pass_the_expression_gate() -> TesseraResult<()> {
	let engine = engine_with_components(&[("icon", "<img src=\"{{ src }}\">")]);
	let output = engine.render(
		"<Include component=\"icon\" src=\"profile.png\"/>|<Include component=\"icon\" \
		 src=\"file.png\"/>",
		&Variables::new(),
	)?;
	assert_eq!(
		output,
		"<img src=\"profile.png\">|<!-- tessera: component `icon` failed: unsafe expression \
		 `file.png`: contains the denied fragment `file.` -->"
	);
	Ok(())
}

#[test]
fn include_depth_is_limited() -> TesseraResult<()> {
	let engine = engine_with_components(&[("self", "x<Include component=\"self\"/>")]);
	let output = engine.render("<Include component=\"self\"/>", &Variables::new())?;
	assert!(output.starts_with(&"x".repeat(10)));
	assert!(!output.starts_with(&"x".repeat(11)));
	assert!(output.ends_with("exceeds the maximum include depth of 10 -->"));
	Ok(())
}

#[test]
fn callback_variables_are_isolated_between_siblings() -> TesseraResult<()> {
	let mut engine = engine_with_components(&[("a", "A:{{ Flag }};"), ("b", "B:{{ Flag }};")]);
	engine.on_before_component(|descriptor, variables| {
		if descriptor.path == "a" {
			variables.insert("Flag", "set-by-a");
		}
	});

	let output = engine.render(
		"<Include component=\"a\"/><Include component=\"b\"/>",
		&Variables::new(),
	)?;
	assert_eq!(output, "A:set-by-a;B:;");
	assert_eq!(engine.get_variable("Flag"), None);

	Ok(())
}

#[test]
fn callback_variables_outrank_parameters() -> TesseraResult<()> {
	let mut engine = engine_with_components(&[("a", "{{ Flag }}")]);
	engine.on_before_component(|descriptor, variables| {
		if descriptor.name.as_deref() == Some("override") {
			variables.insert("Flag", "callback");
		}
	});

	let output = engine.render(
		"<Include component=\"a\" name=\"override\" Flag=\"param\"/>|<Include component=\"a\" \
		 name=\"plain\" Flag=\"param\"/>",
		&Variables::new(),
	)?;
	assert_eq!(output, "callback|param");

	Ok(())
}

#[test]
fn store_is_restored_when_the_component_fails() -> TesseraResult<()> {
	let mut engine = engine_with_components(&[("broken", "{{ System.Exit }}")]);
	engine.set_variable("Theme", "light")?;
	engine.on_before_component(|_, variables| {
		variables.insert("Theme", "dark");
		variables.insert("Extra", true);
	});

	engine.render("<Include component=\"broken\"/>", &Variables::new())?;
	assert_eq!(engine.get_variable("Theme"), Some(Value::from("light")));
	assert_eq!(engine.get_variable("Extra"), None);

	Ok(())
}

#[test]
fn post_render_callback_replaces_output() -> TesseraResult<()> {
	let mut engine = engine_with_components(&[("who", "hi")]);
	engine.on_after_component(|descriptor, output| format!("[{}:{output}]", descriptor.path));

	let output = engine.render("<Include component=\"who\"/>", &Variables::new())?;
	assert_eq!(output, "[who:hi]");

	Ok(())
}

#[test]
fn memory_loader_normalizes_paths() -> TesseraResult<()> {
	let loader = memory_loader(&[("/Cards/Main.html", "main"), ("cards/default.htm", "fallback")]);
	assert_eq!(loader.len(), 2);
	assert!(loader.load("cards/main")?.is_some());
	assert!(loader.load("CARDS")?.is_some());
	assert!(loader.load("cards/other")?.is_none());
	assert!(loader.remove("cards/main.html"));
	assert!(loader.load("cards/main")?.is_none());
	Ok(())
}

#[test]
fn memory_loader_validates_templates() {
	let loader = MemoryLoader::new();
	assert!(matches!(
		loader.insert("bad", "<script>x</script>"),
		Err(TesseraError::UnsafeTemplate { .. })
	));
	assert!(loader.is_empty());
}

// --- Layout tests ---

#[test]
fn layout_sections_and_body() -> TesseraResult<()> {
	let engine = engine_with_components(&[(
		"main",
		"<html><title><RenderSection name=\"title\" required=\"true\"/></title><RenderSection \
		 name=\"aside\">no aside</RenderSection>|<RenderBody/></html>",
	)]);

	let wrapped = engine.render(
		"<Layout name=\"main\"><Section name=\"Title\">T</Section>Body {{ N }}</Layout>",
		&variables(json!({ "N": 1 })),
	)?;
	insta::assert_snapshot!(wrapped, @"<html><title>T</title>no aside|Body 1</html>");

	let adopted = engine.render(
		"<Layout name=\"main\"/><Section name=\"title\">T</Section>Body {{ N }}",
		&variables(json!({ "N": 1 })),
	)?;
	assert_eq!(adopted, wrapped);

	Ok(())
}

#[test]
fn layout_missing_required_section() -> TesseraResult<()> {
	let engine = engine_with_components(&[("main", "<RenderSection name=\"title\" required=\"true\"/><RenderBody/>")]);
	let output = engine.render("<Layout name=\"main\">Body</Layout>", &Variables::new())?;
	assert_eq!(output, "<!-- tessera: missing required section `title` -->Body");
	Ok(())
}

#[test]
fn missing_layout_renders_body() -> TesseraResult<()> {
	let engine = engine_with_components(&[]);
	let output = engine.render(
		"<Layout name=\"ghost\"><Section name=\"s\">S</Section>Body</Layout>",
		&Variables::new(),
	)?;
	assert_eq!(output, "Body");
	Ok(())
}

#[test]
fn self_wrapping_layout_stops_at_include_depth() -> TesseraResult<()> {
	let engine = engine_with_components(&[("shell", "<Layout name=\"shell\"><RenderBody/></Layout>")]);
	let output = engine.render("<Layout name=\"shell\">hi</Layout>", &Variables::new())?;
	assert_eq!(
		output,
		"<!-- tessera: layout `shell` exceeds the maximum include depth of 10 -->hi"
	);
	Ok(())
}

#[test]
fn alternating_layouts_stop_at_include_depth() -> TesseraResult<()> {
	let engine = engine_with_components(&[
		("a", "<Layout name=\"b\">a<RenderBody/></Layout>"),
		("b", "<Layout name=\"a\">b<RenderBody/></Layout>"),
	]);
	let output = engine.render("<Layout name=\"a\">x</Layout>", &Variables::new())?;
	assert_eq!(
		output,
		"<!-- tessera: layout `a` exceeds the maximum include depth of 10 -->bababababax"
	);
	Ok(())
}

// --- Cache tests ---

#[test]
fn template_keys() {
	assert_eq!(
		TemplateKey::for_source("short", 256),
		TemplateKey::Literal("short".to_string())
	);
	let long = "x".repeat(300);
	match TemplateKey::for_source(&long, 256) {
		TemplateKey::Digest(hex) => assert_eq!(hex.len(), 64),
		TemplateKey::Literal(_) => panic!("long templates are keyed by digest"),
	}
	assert_eq!(
		TemplateKey::for_source(&long, 256),
		TemplateKey::for_source(&long, 256)
	);
}

#[test]
fn bounded_cache_evicts_least_recently_accessed() {
	let cache: BoundedCache<u32, u32> = BoundedCache::new(5);
	for key in 0..5 {
		cache.insert(key, key * 10);
	}
	assert_eq!(cache.get(&0), Some(0));
	cache.insert(5, 50);

	assert_eq!(cache.len(), 5);
	assert_eq!(cache.get(&1), None);
	assert_eq!(cache.get(&0), Some(0));
	assert_eq!(cache.stats().evictions, 1);
}

#[test]
fn bounded_cache_rejected_entries_are_misses() {
	let cache: BoundedCache<&str, u32> = BoundedCache::new(5);
	cache.insert("k", 1);
	assert_eq!(cache.get_if(&"k", |_| false), None);
	assert_eq!(cache.len(), 0);

	let stats = cache.stats();
	assert_eq!(stats.hits, 0);
	assert_eq!(stats.misses, 1);
}

#[test]
fn tree_cache_statistics() -> TesseraResult<()> {
	let engine = Engine::default();
	engine.render("{{ a }}", &Variables::new())?;
	engine.render("{{ a }}", &Variables::new())?;

	let stats = engine.cache_stats().templates;
	assert_eq!(stats.entries, 1);
	assert_eq!(stats.hits, 1);
	assert_eq!(stats.misses, 1);

	engine.clear_caches();
	assert_eq!(engine.cache_stats(), EngineCacheStats::default());

	Ok(())
}

#[test]
fn tree_cache_overflow_evicts() -> TesseraResult<()> {
	let mut config = EngineConfig::default();
	config.cache.max_templates = 5;
	let engine = Engine::new(config);
	for index in 0..6 {
		engine.render(&format!("template {index}"), &Variables::new())?;
	}

	let stats = engine.cache_stats().templates;
	assert_eq!(stats.entries, 5);
	assert_eq!(stats.evictions, 1);

	Ok(())
}

#[test]
fn prepared_templates() -> TesseraResult<()> {
	let engine = engine_with_components(&[("a", "A"), ("nav/main", "M")]);
	let source = "<Include component=\"a\"/><Nav component=\"main\"/><Include component=\"a\"/>";
	let prepared = engine.prepare_template(source)?;

	assert_eq!(prepared.cache_key, TemplateKey::Literal(source.to_string()));
	assert_eq!(prepared.component_refs, vec!["a".to_string(), "nav/main".to_string()]);
	assert_eq!(engine.render_prepared(&prepared, &Variables::new())?, "AMA");
	assert_eq!(engine.render(source, &Variables::new())?, "AMA");
	assert_eq!(engine.cache_stats().templates.hits, 1);

	Ok(())
}

#[test]
fn prepared_template_serializes_metadata_only() -> TesseraResult<()> {
	let engine = engine_with_components(&[]);
	let source = "<Include component=\"a\"/>";
	let prepared = engine.prepare_template(source)?;

	let value = serde_json::to_value(&prepared).unwrap_or_else(|e| panic!("serialize: {e}"));
	assert_eq!(
		value,
		json!({
			"cache_key": { "Literal": source },
			"component_refs": ["a"],
		})
	);

	Ok(())
}

#[test]
#[traced_test]
fn compile_is_logged() -> TesseraResult<()> {
	Engine::default().render("logged {{ x }}", &Variables::new())?;
	assert!(logs_contain("compiled template"));
	Ok(())
}

// --- File rendering tests ---

#[test]
fn render_file_candidates() -> TesseraResult<()> {
	let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
	write_file(tmp.path(), "about.html", "about");
	write_file(tmp.path(), "blog/default.html", "blog index");
	write_file(tmp.path(), "notes.htm", "notes");
	let engine = file_engine(tmp.path());
	let none = Variables::new();

	assert_eq!(engine.render_file("about", &none, true)?, "about");
	assert_eq!(engine.render_file("about.html", &none, true)?, "about");
	assert_eq!(engine.render_file("blog", &none, true)?, "blog index");
	assert_eq!(engine.render_file("notes.htm", &none, false)?, "notes");
	assert!(matches!(
		engine.render_file("missing", &none, true),
		Err(TesseraError::TemplateNotFound { .. })
	));

	Ok(())
}

#[rstest]
#[case::outside("../outside.html")]
#[case::inside("blog/../about")]
fn render_file_rejects_traversal(#[case] path: &str) {
	let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
	write_file(tmp.path(), "about.html", "about");
	write_file(tmp.path(), "blog/default.html", "blog");
	let engine = file_engine(tmp.path());

	let result = engine.render_file(path, &Variables::new(), true);
	assert!(matches!(result, Err(TesseraError::UnsafeFilePath { .. })));
}

#[test]
fn render_file_without_roots_is_denied() {
	let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
	write_file(tmp.path(), "about.html", "about");
	let mut config = EngineConfig::default();
	config.paths.pages_dir = tmp.path().to_path_buf();

	let result = Engine::new(config).render_file("about", &Variables::new(), true);
	assert!(matches!(result, Err(TesseraError::UnsafeFilePath { .. })));
}

#[test]
fn engine_from_config_file() -> TesseraResult<()> {
	let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
	write_file(
		tmp.path(),
		"tessera.toml",
		"[paths]\npages_dir = \"pages\"\ncomponents_dir = \"components\"\n\n[security]\nallowed_roots = [\".\"]\n",
	);
	write_file(tmp.path(), "pages/index.html", "<Include component=\"greeting\" Who=\"{{ Name }}\"/>");
	write_file(tmp.path(), "components/greeting.html", "Hello {{ Who }}");

	let engine = Engine::from_root(tmp.path())?;
	let output = engine.render_file("index", &variables(json!({ "Name": "Ada" })), true)?;
	assert_eq!(output, "Hello Ada");

	Ok(())
}

#[test]
fn engine_from_root_without_config() -> TesseraResult<()> {
	let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
	write_file(tmp.path(), "index.html", "<Block component=\"card\"/>");
	write_file(tmp.path(), "block/card.html", "card");

	let engine = Engine::from_root(tmp.path())?;
	assert_eq!(engine.render_file("index", &Variables::new(), true)?, "card");

	Ok(())
}

#[test]
fn source_cache_reloads_modified_files() -> TesseraResult<()> {
	let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
	write_file(tmp.path(), "page.html", "v1 {{ N }}");
	let engine = file_engine(tmp.path());
	let data = variables(json!({ "N": 1 }));

	assert_eq!(engine.render_cached_file("page", "page", None, false, &data)?, "v1 1");
	assert_eq!(engine.render_file("page", &data, true)?, "v1 1");

	write_file(tmp.path(), "page.html", "v2 {{ N }}");
	touch_later(tmp.path(), "page.html", 10);

	assert_eq!(engine.render_cached_file("page", "page", None, false, &data)?, "v2 1");
	assert_eq!(engine.render_file("page", &data, true)?, "v2 1");

	let stats = engine.cache_stats();
	assert_eq!(stats.sources.misses, 2);
	assert_eq!(stats.templates.entries, 1);

	Ok(())
}

#[test]
fn output_cache_serves_stored_text() -> TesseraResult<()> {
	let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
	write_file(tmp.path(), "page.html", "Hi {{ Name }}");
	let engine = file_engine(tmp.path());
	let ada = variables(json!({ "Name": "Ada" }));
	let bob = variables(json!({ "Name": "Bob" }));

	assert_eq!(engine.render_cached_file("page", "home", None, false, &ada)?, "Hi Ada");
	assert_eq!(engine.render_cached_file("page", "home", None, false, &bob)?, "Hi Ada");
	assert_eq!(engine.cache_stats().outputs.hits, 1);

	assert!(engine.invalidate_output("home"));
	assert!(!engine.invalidate_output("home"));
	assert_eq!(engine.render_cached_file("page", "home", None, false, &bob)?, "Hi Bob");

	Ok(())
}

#[test]
fn data_aware_output_cache_separates_bindings() -> TesseraResult<()> {
	let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
	write_file(tmp.path(), "page.html", "Hi {{ Name }}");
	let engine = file_engine(tmp.path());
	let ada = variables(json!({ "Name": "Ada" }));
	let bob = variables(json!({ "Name": "Bob" }));

	assert_eq!(engine.render_cached_file("page", "home", None, true, &ada)?, "Hi Ada");
	assert_eq!(engine.render_cached_file("page", "home", None, true, &bob)?, "Hi Bob");
	assert_eq!(engine.render_cached_file("page", "home", None, true, &ada)?, "Hi Ada");
	let entries = engine.cache_stats().outputs.entries;
	assert!(entries >= 2);
	assert_eq!(engine.invalidate_output_prefix("home::"), entries);
	assert_eq!(engine.cache_stats().outputs.entries, 0);

	Ok(())
}

#[test]
fn expired_outputs_are_rendered_again() -> TesseraResult<()> {
	let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
	write_file(tmp.path(), "page.html", "Hi {{ Name }}");
	let engine = file_engine(tmp.path());
	let expired = Some(SystemTime::now() - Duration::from_secs(1));

	assert_eq!(
		engine.render_cached_file("page", "k", expired, false, &variables(json!({ "Name": "Ada" })))?,
		"Hi Ada"
	);
	assert_eq!(
		engine.render_cached_file("page", "k", expired, false, &variables(json!({ "Name": "Bob" })))?,
		"Hi Bob"
	);

	Ok(())
}

#[test]
fn invalidate_output_prefix_counts_removed_entries() -> TesseraResult<()> {
	let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
	write_file(tmp.path(), "page.html", "x");
	let engine = file_engine(tmp.path());
	let none = Variables::new();

	engine.render_cached_file("page", "page:a", None, false, &none)?;
	engine.render_cached_file("page", "page:b", None, false, &none)?;
	engine.render_cached_file("page", "other", None, false, &none)?;

	assert_eq!(engine.invalidate_output_prefix("page:"), 2);
	assert_eq!(engine.cache_stats().outputs.entries, 1);

	Ok(())
}

#[test]
fn cached_and_uncached_paths_agree() -> TesseraResult<()> {
	let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
	write_file(
		tmp.path(),
		"page.html",
		"<ForEach var=\"x\" in=\"Items\"><Block component=\"item\" Label=\"{{ x }}\"/></ForEach>",
	);
	write_file(tmp.path(), "block/item.html", "<i>{{ Label | upper }}</i>");
	let engine = file_engine(tmp.path());
	let data = variables(json!({ "Items": ["a", "b"] }));

	let uncached = engine.render_file("page", &data, true)?;
	let cached = engine.render_cached_file("page", "page", None, true, &data)?;
	let hit = engine.render_cached_file("page", "page", None, true, &data)?;
	engine.clear_caches();
	let after_clear = engine.render_cached_file("page", "page", None, true, &data)?;

	assert_eq!(uncached, "<i>A</i><i>B</i>");
	assert_eq!(cached, uncached);
	assert_eq!(hit, uncached);
	assert_eq!(after_clear, uncached);

	Ok(())
}

// --- Config tests ---

#[test]
fn config_from_toml() -> TesseraResult<()> {
	let config = EngineConfig::from_toml_str(
		"[security]\nallow_indexers = false\n\n[security.limits]\nmax_loop_iterations = \
		 5\n\n[cache]\nmax_templates = 7\n",
	)?;
	assert!(!config.security.allow_indexers);
	assert_eq!(config.security.limits.max_loop_iterations, 5);
	assert_eq!(config.security.limits.max_recursion_depth, 50);
	assert_eq!(config.cache.max_templates, 7);
	assert_eq!(config.cache.max_outputs, 1000);
	Ok(())
}

#[test]
fn config_parse_errors() {
	let result = EngineConfig::from_toml_str("[security\n");
	assert!(matches!(result, Err(TesseraError::ConfigParse(_))));
}

#[test]
fn config_load_without_file() -> TesseraResult<()> {
	let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
	assert!(EngineConfig::load(tmp.path())?.is_none());
	Ok(())
}
